//! Pump sequencer: turns "start" / "stop" into timed writes on the pump pin.
//!
//! The remote firmware treats the control pin as an edge trigger, so a level
//! write is not enough:
//!
//! ```text
//! start:  OFF ─500ms─▶ ON ─500ms─▶ OFF     (pump left running)
//! stop:   OFF ─500ms─▶ ON                  (pump stopped)
//! ```
//!
//! Every caller (web toggle, auto mode) goes through this module, and the
//! store's `is_processing` flag keeps at most one sequence in flight. A
//! request that finds a sequence running is answered immediately; nothing
//! is queued.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::debounce::DebounceGate;
use crate::pins::{PinApi, PumpCommand};
use crate::store::{Begin, PumpHandle, PumpWriter};

pub const STATUS_STARTING: &str = "Starting pump: OFF→ON→OFF";
pub const STATUS_STOPPING: &str = "Stopping pump: OFF→ON";
pub const STATUS_STARTED: &str = "Pump started successfully";
pub const STATUS_STOPPED: &str = "Pump stopped successfully";
pub const STATUS_ERROR: &str = "Error controlling pump";
pub const STATUS_BUSY: &str = "Processing previous command...";
pub const STATUS_DEBOUNCED: &str = "Please wait before clicking again";

const START_STEPS: [PumpCommand; 3] = [PumpCommand::Off, PumpCommand::On, PumpCommand::Off];
const STOP_STEPS: [PumpCommand; 2] = [PumpCommand::Off, PumpCommand::On];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    fn steps(self) -> &'static [PumpCommand] {
        match self {
            Self::Start => &START_STEPS,
            Self::Stop => &STOP_STEPS,
        }
    }

    fn announce(self) -> &'static str {
        match self {
            Self::Start => STATUS_STARTING,
            Self::Stop => STATUS_STOPPING,
        }
    }

    fn success_status(self) -> &'static str {
        match self {
            Self::Start => STATUS_STARTED,
            Self::Stop => STATUS_STOPPED,
        }
    }

    fn outcome(self) -> ToggleOutcome {
        match self {
            Self::Start => ToggleOutcome::Started,
            Self::Stop => ToggleOutcome::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Who asked for the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trigger {
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "AUTOMATIC")]
    Auto,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Auto => "AUTOMATIC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleOutcome {
    Started,
    Stopped,
    Debounced,
    AlreadyProcessing,
    AlreadyInState,
    Failed,
}

/// The write that aborted a sequence (1-based step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFailure {
    pub step: usize,
    pub command: PumpCommand,
}

/// Summary of a sequence that actually ran, for the history recorder.
#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub action: Action,
    pub trigger: Trigger,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub failure: Option<StepFailure>,
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

pub struct Sequencer<P> {
    pins: Arc<P>,
    pump_pin: String,
    step_delay: Duration,
    writer: PumpWriter,
    gate: Mutex<DebounceGate>,
    reports: Option<mpsc::UnboundedSender<SequenceReport>>,
}

impl<P: PinApi> Sequencer<P> {
    pub fn new(
        pins: Arc<P>,
        pump_pin: &str,
        step_delay: Duration,
        debounce: Duration,
        writer: PumpWriter,
    ) -> Self {
        Self {
            pins,
            pump_pin: pump_pin.to_string(),
            step_delay,
            writer,
            gate: Mutex::new(DebounceGate::new(debounce)),
            reports: None,
        }
    }

    /// Send a [`SequenceReport`] after every sequence that ran.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<SequenceReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn state(&self) -> PumpHandle {
        self.writer.handle()
    }

    /// A toggle from a user: debounce first, then the processing check.
    pub async fn manual_toggle(&self) -> ToggleOutcome {
        let accepted = self.gate.lock().await.try_accept(Instant::now());
        if !accepted {
            debug!("manual toggle debounced");
            self.writer.set_status(STATUS_DEBOUNCED).await;
            return ToggleOutcome::Debounced;
        }
        self.toggle(Trigger::Manual).await
    }

    pub async fn toggle(&self, trigger: Trigger) -> ToggleOutcome {
        self.run(None, trigger, None).await
    }

    pub async fn start(&self, trigger: Trigger) -> ToggleOutcome {
        self.run(Some(Action::Start), trigger, None).await
    }

    /// Start, publishing `reason` as the status once the sequence is ours.
    /// A rejected request leaves the status untouched by `reason`.
    pub async fn start_because(&self, trigger: Trigger, reason: &str) -> ToggleOutcome {
        self.run(Some(Action::Start), trigger, Some(reason)).await
    }

    pub async fn stop(&self, trigger: Trigger) -> ToggleOutcome {
        self.run(Some(Action::Stop), trigger, None).await
    }

    async fn run(
        &self,
        requested: Option<Action>,
        trigger: Trigger,
        reason: Option<&str>,
    ) -> ToggleOutcome {
        let want_running = requested.map(|a| a == Action::Stop);
        let action = match self.writer.begin(want_running).await {
            Begin::Began { was_running: true } => Action::Stop,
            Begin::Began { was_running: false } => Action::Start,
            Begin::AlreadyProcessing => {
                info!(trigger = trigger.as_str(), "pump request rejected: sequence in flight");
                self.writer.set_status(STATUS_BUSY).await;
                return ToggleOutcome::AlreadyProcessing;
            }
            Begin::AlreadyInState => {
                debug!(trigger = trigger.as_str(), ?requested, "pump already in requested state");
                return ToggleOutcome::AlreadyInState;
            }
        };

        info!(action = action.as_str(), trigger = trigger.as_str(), "pump sequence started");
        if let Some(reason) = reason {
            self.writer.set_status(reason).await;
        }
        self.writer.set_status(action.announce()).await;

        let started_at = OffsetDateTime::now_utc();
        let result = self.drive(action).await;
        let finished_at = OffsetDateTime::now_utc();

        let outcome = match result {
            Ok(()) => {
                let running = action == Action::Start;
                self.writer.finish(Some(running), action.success_status()).await;
                info!(action = action.as_str(), running, "pump sequence complete");
                action.outcome()
            }
            Err(failure) => {
                // Physical pump may be mid-sequence; the believed state is
                // deliberately left as it was.
                error!(
                    action = action.as_str(),
                    step = failure.step,
                    command = %failure.command,
                    "pump sequence aborted, pump state unknown"
                );
                self.writer.finish(None, STATUS_ERROR).await;
                ToggleOutcome::Failed
            }
        };

        if let Some(reports) = &self.reports {
            let _ = reports.send(SequenceReport {
                action,
                trigger,
                started_at,
                finished_at,
                failure: result.err(),
            });
        }

        outcome
    }

    async fn drive(&self, action: Action) -> Result<(), StepFailure> {
        for (i, &command) in action.steps().iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.step_delay).await;
            }
            if !self.pins.write_pin(&self.pump_pin, command.value()).await {
                return Err(StepFailure {
                    step: i + 1,
                    command,
                });
            }
            debug!(step = i + 1, %command, "pump command sent");
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
