//! Temperature-triggered automatic pump start.
//!
//! ```text
//!  Armed ──[temp ≥ threshold, pump stopped & idle]──▶ start(Auto) ──▶ Disarmed
//!    ▲                                                                   │
//!    └──────────────[temp < threshold while pump stopped]────────────────┘
//! ```
//!
//! A failed start stays disarmed too: the pump pin may already have seen the
//! OFF→ON edge, and a second sequence would toggle the pump back off.
//!
//! The evaluator also disarms whenever it sees the pump running, whoever
//! started it, so a manual stop on a hot day does not immediately restart
//! the pump.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::pins::PinApi;
use crate::poller::SensorReading;
use crate::sequencer::{Sequencer, ToggleOutcome, Trigger};
use crate::store::PumpState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoModeSettings {
    pub enabled: bool,
    pub threshold: f64,
}

/// Settings shared between the evaluator and the web API.
pub type SharedSettings = Arc<RwLock<AutoModeSettings>>;

fn trigger_status(temperature: f64, threshold: f64) -> String {
    format!("Auto mode: temperature {temperature:.1}°C ≥ {threshold:.1}°C, starting pump")
}

pub struct AutoModeEvaluator {
    settings: SharedSettings,
    armed: bool,
}

impl AutoModeEvaluator {
    pub fn new(settings: SharedSettings) -> Self {
        Self {
            settings,
            armed: true,
        }
    }

    /// Decide whether this reading should start the pump. Updates the arming
    /// state as a side effect.
    fn should_trigger(
        &mut self,
        settings: AutoModeSettings,
        reading: &SensorReading,
        pump: &PumpState,
    ) -> bool {
        if pump.is_running {
            self.armed = false;
            return false;
        }
        // A substituted value says nothing about the real temperature.
        if reading.temperature_fallback {
            return false;
        }
        if reading.temperature < settings.threshold {
            self.armed = true;
            return false;
        }
        settings.enabled && self.armed && !pump.is_processing
    }

    /// Evaluate one reading and start the pump if the conditions hold.
    /// Returns the sequencer outcome when a start was attempted.
    pub async fn evaluate<P: PinApi>(
        &mut self,
        reading: &SensorReading,
        sequencer: &Sequencer<P>,
    ) -> Option<ToggleOutcome> {
        let settings = *self.settings.read().await;
        let pump = sequencer.state().snapshot().await;

        if !self.should_trigger(settings, reading, &pump) {
            return None;
        }

        info!(
            temperature = reading.temperature,
            threshold = settings.threshold,
            "auto mode: temperature at or above threshold, starting pump"
        );
        self.armed = false;

        let reason = trigger_status(reading.temperature, settings.threshold);
        let outcome = sequencer.start_because(Trigger::Auto, &reason).await;
        match outcome {
            ToggleOutcome::Started => {}
            ToggleOutcome::Failed => {
                warn!("auto mode: start failed, waiting for temperature to drop before retrying");
            }
            other => {
                debug!(?other, "auto mode: start not performed");
                self.armed = true;
            }
        }
        Some(outcome)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::fake::FakePins;
    use crate::store;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn settings(enabled: bool) -> SharedSettings {
        Arc::new(RwLock::new(AutoModeSettings {
            enabled,
            threshold: 37.0,
        }))
    }

    fn reading(temperature: f64) -> SensorReading {
        SensorReading {
            temperature,
            soil_moisture: 40.0,
            observed_at: OffsetDateTime::now_utc(),
            temperature_fallback: false,
            soil_moisture_fallback: false,
        }
    }

    fn sequencer(pins: &Arc<FakePins>) -> Sequencer<FakePins> {
        let (writer, _) = store::channel(Duration::from_secs(5));
        Sequencer::new(
            Arc::clone(pins),
            "V2",
            Duration::from_millis(500),
            Duration::from_millis(1000),
            writer,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn hot_reading_starts_pump_once() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(true));

        assert_eq!(
            eval.evaluate(&reading(38.0), &seq).await,
            Some(ToggleOutcome::Started)
        );
        assert_eq!(eval.evaluate(&reading(38.0), &seq).await, None);
        assert_eq!(eval.evaluate(&reading(39.5), &seq).await, None);

        assert_eq!(pins.written_values(), vec![0, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_reason_is_published_once_sequence_begins() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let (_, mut rx) = seq.state().subscribe().await;
        let mut eval = AutoModeEvaluator::new(settings(true));

        eval.evaluate(&reading(38.0), &seq).await;

        let began = rx.recv().await.unwrap();
        assert!(began.is_processing);
        let reason = rx.recv().await.unwrap();
        assert_eq!(
            reason.status,
            "Auto mode: temperature 38.0°C ≥ 37.0°C, starting pump"
        );
        assert!(reason.is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_inclusive() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(true));

        assert_eq!(
            eval.evaluate(&reading(37.0), &seq).await,
            Some(ToggleOutcome::Started)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn running_pump_is_not_restarted() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        seq.start(Trigger::Manual).await;
        pins.clear_writes();

        let mut eval = AutoModeEvaluator::new(settings(true));
        assert_eq!(eval.evaluate(&reading(38.0), &seq).await, None);
        assert!(pins.written_values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_mode_never_triggers() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(false));

        assert_eq!(eval.evaluate(&reading(45.0), &seq).await, None);
        assert!(pins.written_values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cool_reading_does_not_trigger() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(true));

        assert_eq!(eval.evaluate(&reading(36.9), &seq).await, None);
        assert!(pins.written_values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_temperature_never_triggers() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(true));

        let mut r = reading(40.0);
        r.temperature_fallback = true;
        assert_eq!(eval.evaluate(&r, &seq).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rearms_only_after_stop_and_cool_down() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(true));

        assert_eq!(
            eval.evaluate(&reading(38.0), &seq).await,
            Some(ToggleOutcome::Started)
        );

        // Manual stop while still hot: no immediate restart.
        seq.stop(Trigger::Manual).await;
        assert_eq!(eval.evaluate(&reading(38.0), &seq).await, None);

        // Cools below the threshold, then crosses it again.
        assert_eq!(eval.evaluate(&reading(35.0), &seq).await, None);
        assert_eq!(
            eval.evaluate(&reading(37.5), &seq).await,
            Some(ToggleOutcome::Started)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_auto_start_waits_for_cool_down() {
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(settings(true));

        // The OFF→ON edge went out before the final write failed.
        pins.fail_write(3);
        assert_eq!(
            eval.evaluate(&reading(38.0), &seq).await,
            Some(ToggleOutcome::Failed)
        );
        assert_eq!(eval.evaluate(&reading(38.0), &seq).await, None);
        assert_eq!(eval.evaluate(&reading(39.0), &seq).await, None);
        assert_eq!(pins.written_values(), vec![0, 1]);

        assert_eq!(eval.evaluate(&reading(36.0), &seq).await, None);
        assert_eq!(
            eval.evaluate(&reading(38.0), &seq).await,
            Some(ToggleOutcome::Started)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn processing_pump_is_left_alone() {
        let pins = Arc::new(FakePins::new());
        let seq = Arc::new(sequencer(&pins));
        let mut eval = AutoModeEvaluator::new(settings(true));

        let manual = tokio::spawn({
            let seq = Arc::clone(&seq);
            async move { seq.toggle(Trigger::Manual).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(eval.evaluate(&reading(38.0), &seq).await, None);
        assert_eq!(manual.await.unwrap(), ToggleOutcome::Started);
        assert_eq!(pins.written_values(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn settings_changes_take_effect() {
        let shared = settings(false);
        let pins = Arc::new(FakePins::new());
        let seq = sequencer(&pins);
        let mut eval = AutoModeEvaluator::new(Arc::clone(&shared));

        assert_eq!(eval.evaluate(&reading(30.0), &seq).await, None);
        {
            let mut s = shared.write().await;
            s.enabled = true;
            s.threshold = 29.0;
        }
        let pump = seq.state().snapshot().await;
        let current = *shared.read().await;
        assert!(eval.should_trigger(current, &reading(30.0), &pump));
    }
}
