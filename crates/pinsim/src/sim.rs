//! Stateful device simulator for local development.
//!
//! Stands in for the field device behind the cloud pin API:
//! - Air temperature: diurnal sinusoid plus a mean-reverting random walk
//! - Soil moisture (%): slow drying drift, rises while the pump runs
//! - Pump firmware: a 0 → 1 edge on the pump pin toggles the pump; any other
//!   write only stores the value
//!
//! Time is simulated: callers advance it with [`DeviceSim::tick`], so the
//! model is deterministic apart from its noise.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 ≈ N(0,1).
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Warm day that never reaches the auto-mode threshold.
    Mild,
    /// Afternoon peaks well above 37 °C; exercises auto mode.
    Hot,
    /// Mild weather, noisy sensors, and roughly one read in ten failing.
    Flaky,
}

struct Profile {
    mean_temperature: f64,
    diurnal_amplitude: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    read_failure_prob: f32,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "flaky" => Self::Flaky,
            _ => Self::Mild, // default
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Mild => Profile {
                mean_temperature: 27.0,
                diurnal_amplitude: 5.0,
                walk_sigma: 0.05,
                noise_sigma: 0.1,
                read_failure_prob: 0.0,
            },
            Self::Hot => Profile {
                mean_temperature: 35.0,
                diurnal_amplitude: 5.0,
                walk_sigma: 0.05,
                noise_sigma: 0.1,
                read_failure_prob: 0.0,
            },
            Self::Flaky => Profile {
                mean_temperature: 29.0,
                diurnal_amplitude: 4.0,
                walk_sigma: 0.2,
                noise_sigma: 0.8,
                read_failure_prob: 0.1,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mild => write!(f, "mild"),
            Self::Hot => write!(f, "hot"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pins
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PinNames {
    pub temperature: String,
    pub soil_moisture: String,
    pub pump: String,
}

impl Default for PinNames {
    fn default() -> Self {
        Self {
            temperature: "V0".into(),
            soil_moisture: "V1".into(),
            pump: "V2".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteResult {
    Stored,
    /// The write was a 0 → 1 edge on the pump pin; carries the new running
    /// state.
    PumpToggled(bool),
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// % per second while idle.
const DRYING_RATE: f64 = 0.01;
/// % per second while the pump runs.
const WETTING_RATE: f64 = 0.5;
/// Pull of the temperature walk back toward zero, per second.
const MEAN_REVERSION: f64 = 0.02;

pub struct DeviceSim {
    pins: PinNames,
    profile: Profile,
    diurnal_period_s: f64,

    elapsed_s: f64,
    temperature_walk: f64,
    soil_moisture: f64,
    pump_running: bool,
    pump_pin_value: f64,
    /// Values written to pins that are not modelled.
    other_pins: HashMap<String, f64>,
}

impl DeviceSim {
    /// `diurnal_period_s` is the simulated day length: 600 gives a 10 minute
    /// day for quick iteration, 86400 runs in real time. Simulated time
    /// starts at dawn, so the first peak arrives after a quarter period.
    pub fn new(scenario: Scenario, pins: PinNames, diurnal_period_s: f64) -> Self {
        Self {
            pins,
            profile: scenario.profile(),
            diurnal_period_s: diurnal_period_s.max(1.0),
            elapsed_s: 0.0,
            temperature_walk: 0.0,
            soil_moisture: 55.0,
            pump_running: false,
            pump_pin_value: 0.0,
            other_pins: HashMap::new(),
        }
    }

    pub fn pump_running(&self) -> bool {
        self.pump_running
    }

    /// Advance simulated time by `dt_s` seconds.
    pub fn tick(&mut self, dt_s: f64) {
        self.elapsed_s += dt_s;

        let pull = -MEAN_REVERSION * self.temperature_walk * dt_s;
        let step = gaussian(0.0, self.profile.walk_sigma * dt_s.sqrt());
        self.temperature_walk += pull + step;

        let delta = if self.pump_running {
            WETTING_RATE
        } else {
            -DRYING_RATE
        };
        self.soil_moisture = (self.soil_moisture + delta * dt_s).clamp(0.0, 100.0);
    }

    /// Noise-free temperature at the current simulated time.
    pub fn true_temperature(&self) -> f64 {
        let phase = 2.0 * PI * self.elapsed_s / self.diurnal_period_s;
        self.profile.mean_temperature
            + self.profile.diurnal_amplitude * phase.sin()
            + self.temperature_walk
    }

    pub fn soil_moisture(&self) -> f64 {
        self.soil_moisture
    }

    /// True when this read should be answered with a server error.
    pub fn read_fails(&self) -> bool {
        self.profile.read_failure_prob > 0.0 && fastrand::f32() < self.profile.read_failure_prob
    }

    /// Current value of a pin, `None` for a pin the device does not have.
    pub fn read(&self, pin: &str) -> Option<f64> {
        if pin == self.pins.temperature {
            let t = gaussian(self.true_temperature(), self.profile.noise_sigma);
            Some((t * 10.0).round() / 10.0)
        } else if pin == self.pins.soil_moisture {
            let m = gaussian(self.soil_moisture, self.profile.noise_sigma).clamp(0.0, 100.0);
            Some((m * 10.0).round() / 10.0)
        } else if pin == self.pins.pump {
            Some(self.pump_pin_value)
        } else {
            self.other_pins.get(pin).copied()
        }
    }

    /// Store a value. Sensor pins are read-only; writing them is refused.
    pub fn write(&mut self, pin: &str, value: f64) -> Option<WriteResult> {
        if pin == self.pins.temperature || pin == self.pins.soil_moisture {
            return None;
        }
        if pin == self.pins.pump {
            let rising = self.pump_pin_value == 0.0 && value == 1.0;
            self.pump_pin_value = value;
            if rising {
                self.pump_running = !self.pump_running;
                return Some(WriteResult::PumpToggled(self.pump_running));
            }
            return Some(WriteResult::Stored);
        }
        self.other_pins.insert(pin.to_string(), value);
        Some(WriteResult::Stored)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sim(scenario: Scenario) -> DeviceSim {
        DeviceSim::new(scenario, PinNames::default(), 600.0)
    }

    fn max_temperature_over_day(sim: &mut DeviceSim) -> f64 {
        let mut max = f64::MIN;
        for _ in 0..600 {
            sim.tick(1.0);
            max = max.max(sim.true_temperature());
        }
        max
    }

    // -- Pump edge trigger ---------------------------------------------------

    #[test]
    fn start_sequence_leaves_pump_running() {
        let mut d = sim(Scenario::Mild);
        assert_eq!(d.write("V2", 0.0), Some(WriteResult::Stored));
        assert_eq!(d.write("V2", 1.0), Some(WriteResult::PumpToggled(true)));
        assert_eq!(d.write("V2", 0.0), Some(WriteResult::Stored));
        assert!(d.pump_running());
        assert_eq!(d.read("V2"), Some(0.0));
    }

    #[test]
    fn stop_sequence_stops_pump() {
        let mut d = sim(Scenario::Mild);
        for v in [0.0, 1.0, 0.0] {
            d.write("V2", v);
        }
        assert_eq!(d.write("V2", 0.0), Some(WriteResult::Stored));
        assert_eq!(d.write("V2", 1.0), Some(WriteResult::PumpToggled(false)));
        assert!(!d.pump_running());
        assert_eq!(d.read("V2"), Some(1.0));
    }

    #[test]
    fn level_writes_do_not_toggle() {
        let mut d = sim(Scenario::Mild);
        d.write("V2", 1.0);
        assert!(d.pump_running());
        // Pin already high: repeated 1s are not edges.
        assert_eq!(d.write("V2", 1.0), Some(WriteResult::Stored));
        assert_eq!(d.write("V2", 1.0), Some(WriteResult::Stored));
        assert!(d.pump_running());
    }

    // -- Pins ------------------------------------------------------------------

    #[test]
    fn sensor_pins_are_read_only() {
        let mut d = sim(Scenario::Mild);
        assert_eq!(d.write("V0", 50.0), None);
        assert_eq!(d.write("V1", 50.0), None);
    }

    #[test]
    fn unknown_pin_reads_none_until_written() {
        let mut d = sim(Scenario::Mild);
        assert_eq!(d.read("V9"), None);
        d.write("V9", 3.0);
        assert_eq!(d.read("V9"), Some(3.0));
    }

    #[test]
    fn readings_are_rounded_to_one_decimal() {
        let d = sim(Scenario::Mild);
        let t = d.read("V0").unwrap();
        assert!((t * 10.0 - (t * 10.0).round()).abs() < 1e-9);
    }

    // -- Environment model -----------------------------------------------------

    #[test]
    fn soil_dries_while_idle_and_wets_while_pumping() {
        let mut d = sim(Scenario::Mild);
        let start = d.soil_moisture();
        for _ in 0..100 {
            d.tick(1.0);
        }
        let dried = d.soil_moisture();
        assert!(dried < start, "expected drying: {start} -> {dried}");

        d.write("V2", 1.0);
        for _ in 0..20 {
            d.tick(1.0);
        }
        assert!(d.soil_moisture() > dried + 5.0);
    }

    #[test]
    fn soil_moisture_stays_in_range() {
        let mut d = sim(Scenario::Mild);
        d.write("V2", 1.0);
        for _ in 0..1000 {
            d.tick(1.0);
        }
        assert_eq!(d.soil_moisture(), 100.0);
    }

    #[test]
    fn hot_scenario_crosses_threshold() {
        let mut d = sim(Scenario::Hot);
        let max = max_temperature_over_day(&mut d);
        assert!(max >= 37.0, "hot day peaked at {max:.1}");
    }

    #[test]
    fn mild_scenario_stays_below_threshold() {
        let mut d = sim(Scenario::Mild);
        let max = max_temperature_over_day(&mut d);
        assert!(max < 37.0, "mild day peaked at {max:.1}");
    }

    #[test]
    fn only_flaky_reads_fail() {
        let mild = sim(Scenario::Mild);
        assert!((0..1000).all(|_| !mild.read_fails()));

        let flaky = sim(Scenario::Flaky);
        let failures = (0..1000).filter(|_| flaky.read_fails()).count();
        assert!(failures > 0 && failures < 500, "failures={failures}");
    }

    // -- Scenario --------------------------------------------------------------

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("mild"), Scenario::Mild);
        assert_eq!(Scenario::from_str_lossy("HOT"), Scenario::Hot);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Mild);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Mild);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Mild.to_string(), "mild");
        assert_eq!(Scenario::Hot.to_string(), "hot");
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
