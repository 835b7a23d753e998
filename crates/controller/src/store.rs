//! Pump state store: the one place that knows whether the pump is believed to
//! be running and whether a command sequence is in flight.
//!
//! The store is split into a single [`PumpWriter`] (owned by the sequencer)
//! and any number of cloneable [`PumpHandle`] readers. Every change publishes
//! the full state on a broadcast channel, so subscribers see intermediate
//! status messages in order, not just terminal states.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

pub const STATUS_ON: &str = "Pump is ON";
pub const STATUS_OFF: &str = "Pump is OFF";

/// Buffered updates per subscriber before it starts lagging.
const UPDATE_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// State snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpState {
    pub is_running: bool,
    pub is_processing: bool,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_transition_at: Option<OffsetDateTime>,
}

impl PumpState {
    fn initial() -> Self {
        Self {
            is_running: false,
            is_processing: false,
            status: STATUS_OFF.to_string(),
            last_transition_at: None,
        }
    }

    /// Status shown once transient messages expire.
    pub fn steady_status(&self) -> &'static str {
        if self.is_running {
            STATUS_ON
        } else {
            STATUS_OFF
        }
    }
}

/// Result of trying to enter a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// `is_processing` is now set; carries `is_running` at entry.
    Began { was_running: bool },
    AlreadyProcessing,
    /// The pump is already in the state the caller asked for.
    AlreadyInState,
}

// ---------------------------------------------------------------------------
// Shared internals
// ---------------------------------------------------------------------------

struct Inner {
    state: PumpState,
    /// Bumped on every status write; a revert timer only fires if the
    /// generation it was armed with is still current.
    status_generation: u64,
    revert_task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: RwLock<Inner>,
    updates: broadcast::Sender<PumpState>,
    revert_after: Duration,
}

impl Shared {
    fn publish(&self, state: &PumpState) {
        // No subscribers is fine.
        let _ = self.updates.send(state.clone());
    }
}

/// Create the store. Only one writer exists for the lifetime of the process.
pub fn channel(revert_after: Duration) -> (PumpWriter, PumpHandle) {
    let (updates, _) = broadcast::channel(UPDATE_BUFFER);
    let shared = Arc::new(Shared {
        inner: RwLock::new(Inner {
            state: PumpState::initial(),
            status_generation: 0,
            revert_task: None,
        }),
        updates,
        revert_after,
    });

    (
        PumpWriter {
            shared: Arc::clone(&shared),
        },
        PumpHandle { shared },
    )
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PumpHandle {
    shared: Arc<Shared>,
}

impl PumpHandle {
    pub async fn snapshot(&self) -> PumpState {
        self.shared.inner.read().await.state.clone()
    }

    /// Current state plus a receiver for every later update. Both are taken
    /// under the same lock, so no update falls between them.
    pub async fn subscribe(&self) -> (PumpState, broadcast::Receiver<PumpState>) {
        let inner = self.shared.inner.read().await;
        (inner.state.clone(), self.shared.updates.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct PumpWriter {
    shared: Arc<Shared>,
}

impl PumpWriter {
    pub fn handle(&self) -> PumpHandle {
        PumpHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Atomically check and set `is_processing`.
    ///
    /// `want_running` is the state the caller is about to drive the pump
    /// *from*: `Some(false)` for a start, `Some(true)` for a stop, `None` for
    /// a toggle.
    pub async fn begin(&self, want_running: Option<bool>) -> Begin {
        let mut inner = self.shared.inner.write().await;
        if inner.state.is_processing {
            return Begin::AlreadyProcessing;
        }
        if let Some(expected) = want_running {
            if inner.state.is_running != expected {
                return Begin::AlreadyInState;
            }
        }
        inner.state.is_processing = true;
        self.shared.publish(&inner.state);
        Begin::Began {
            was_running: inner.state.is_running,
        }
    }

    /// Set a transient status message; it reverts to the steady message after
    /// the configured delay unless superseded.
    pub async fn set_status(&self, status: &str) {
        let mut inner = self.shared.inner.write().await;
        inner.state.status = status.to_string();
        self.arm_revert(&mut inner);
        self.shared.publish(&inner.state);
    }

    /// Leave the sequence: clear `is_processing`, apply the new running state
    /// when the sequence succeeded, and set the closing status.
    pub async fn finish(&self, running: Option<bool>, status: &str) {
        let mut inner = self.shared.inner.write().await;
        inner.state.is_processing = false;
        if let Some(running) = running {
            if inner.state.is_running != running {
                inner.state.is_running = running;
                inner.state.last_transition_at = Some(OffsetDateTime::now_utc());
            }
        }
        inner.state.status = status.to_string();
        self.arm_revert(&mut inner);
        self.shared.publish(&inner.state);
    }

    fn arm_revert(&self, inner: &mut Inner) {
        if let Some(task) = inner.revert_task.take() {
            task.abort();
        }
        inner.status_generation += 1;

        if inner.state.status == STATUS_ON || inner.state.status == STATUS_OFF {
            return;
        }

        let generation = inner.status_generation;
        let shared = Arc::clone(&self.shared);
        inner.revert_task = Some(tokio::spawn(async move {
            tokio::time::sleep(shared.revert_after).await;
            let mut inner = shared.inner.write().await;
            if inner.status_generation != generation {
                return;
            }
            let steady = inner.state.steady_status();
            inner.state.status = steady.to_string();
            inner.revert_task = None;
            shared.publish(&inner.state);
        }));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
