//! Debounce gate for manual toggle requests.

use std::time::Duration;
use tokio::time::Instant;

/// Rejects a request that arrives within `window` of the last *accepted*
/// one. Timing is measured between request times; how long the previous
/// request took to complete does not matter.
#[derive(Debug)]
pub struct DebounceGate {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    pub fn try_accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}
