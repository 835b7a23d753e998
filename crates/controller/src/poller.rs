//! Sensor poller: reads temperature and soil moisture on a fixed interval and
//! hands each reading to the auto-mode evaluator.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::auto_mode::AutoModeEvaluator;
use crate::pins::PinApi;
use crate::sequencer::Sequencer;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// °C
    pub temperature: f64,
    /// %
    pub soil_moisture: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    /// The value above is the configured fallback, not a measurement.
    pub temperature_fallback: bool,
    pub soil_moisture_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct SensorPins {
    pub temperature: String,
    pub soil_moisture: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Fallbacks {
    pub temperature: f64,
    pub soil_moisture: f64,
}

/// Read both sensor pins concurrently. A failed read is replaced by its
/// fallback; the other value is kept.
pub async fn read_sensors<P: PinApi>(pins: &P, names: &SensorPins, fallback: Fallbacks) -> SensorReading {
    let (temperature, soil_moisture) = tokio::join!(
        pins.read_pin(&names.temperature),
        pins.read_pin(&names.soil_moisture)
    );

    let temperature_fallback = temperature.is_err();
    let temperature = temperature.unwrap_or_else(|e| {
        warn!(fallback = fallback.temperature, "temperature read failed: {e}");
        fallback.temperature
    });

    let soil_moisture_fallback = soil_moisture.is_err();
    let soil_moisture = soil_moisture.unwrap_or_else(|e| {
        warn!(fallback = fallback.soil_moisture, "soil moisture read failed: {e}");
        fallback.soil_moisture
    });

    SensorReading {
        temperature,
        soil_moisture,
        observed_at: OffsetDateTime::now_utc(),
        temperature_fallback,
        soil_moisture_fallback,
    }
}

/// Poll forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run<P: PinApi>(
    pins: Arc<P>,
    names: SensorPins,
    fallback: Fallbacks,
    interval: Duration,
    sequencer: Arc<Sequencer<P>>,
    mut evaluator: AutoModeEvaluator,
    latest: watch::Sender<Option<SensorReading>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_ms = interval.as_millis() as u64,
        temperature_pin = %names.temperature,
        soil_moisture_pin = %names.soil_moisture,
        "sensor poller started"
    );

    loop {
        ticker.tick().await;
        poll_once(&*pins, &names, fallback, &sequencer, &mut evaluator, &latest).await;
    }
}

async fn poll_once<P: PinApi>(
    pins: &P,
    names: &SensorPins,
    fallback: Fallbacks,
    sequencer: &Sequencer<P>,
    evaluator: &mut AutoModeEvaluator,
    latest: &watch::Sender<Option<SensorReading>>,
) {
    let reading = read_sensors(pins, names, fallback).await;
    latest.send_replace(Some(reading.clone()));
    evaluator.evaluate(&reading, sequencer).await;
}

// ===========================================================================
// Tests
// ===========================================================================
