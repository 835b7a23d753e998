//! TOML config file loading, environment overrides, and validation.
//!
//! Every section and field is optional; missing values take the defaults of
//! the deployed device (pins V0/V1/V2, 500 ms steps, 37 °C threshold).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// The pump firmware needs this long between pin writes to see an edge.
pub const MIN_STEP_DELAY_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub blynk: BlynkSection,
    pub pump: PumpSection,
    pub poller: PollerSection,
    pub auto_mode: AutoModeSection,
    pub history: HistorySection,
    pub web: WebSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlynkSection {
    pub base_url: String,
    pub token: String,
    pub temperature_pin: String,
    pub soil_moisture_pin: String,
    pub pump_pin: String,
    pub request_timeout_ms: u64,
}

impl Default for BlynkSection {
    fn default() -> Self {
        Self {
            base_url: "https://blynk.cloud/external/api".into(),
            token: String::new(),
            temperature_pin: "V0".into(),
            soil_moisture_pin: "V1".into(),
            pump_pin: "V2".into(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpSection {
    pub step_delay_ms: u64,
    pub debounce_ms: u64,
    pub status_revert_ms: u64,
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            step_delay_ms: 500,
            debounce_ms: 1_000,
            status_revert_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    pub interval_ms: u64,
    pub fallback_temperature: f64,
    pub fallback_soil_moisture: f64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            fallback_temperature: 25.0,
            fallback_soil_moisture: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoModeSection {
    pub enabled: bool,
    pub temperature_threshold: f64,
}

impl Default for AutoModeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            temperature_threshold: 37.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub enabled: bool,
    pub db_url: String,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            db_url: "sqlite:irrigation.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// Durations, so callers never juggle raw milliseconds.
impl BlynkSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PumpSection {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
    pub fn status_revert(&self) -> Duration {
        Duration::from_millis(self.status_revert_ms)
    }
}

impl PollerSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `BLYNK_TOKEN`, `BLYNK_BASE_URL`, `DB_URL` and `WEB_PORT`.
    /// `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("BLYNK_TOKEN") {
            self.blynk.token = token;
        }
        if let Some(url) = lookup("BLYNK_BASE_URL") {
            self.blynk.base_url = url;
        }
        if let Some(url) = lookup("DB_URL") {
            self.history.db_url = url;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a valid port: {port:?}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_blynk(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_readings(&mut errors);

        if self.history.enabled && self.history.db_url.trim().is_empty() {
            errors.push("history.db_url is empty while history is enabled".into());
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_blynk(&self, errors: &mut Vec<String>) {
        let b = &self.blynk;

        if b.token.trim().is_empty() {
            errors.push("blynk.token is empty (set it in the file or via BLYNK_TOKEN)".into());
        }
        if !(b.base_url.starts_with("http://") || b.base_url.starts_with("https://")) {
            errors.push(format!(
                "blynk.base_url '{}' must start with http:// or https://",
                b.base_url
            ));
        }

        // ── Pin names ───────────────────────────────────────
        let mut seen: HashSet<&str> = HashSet::new();
        for (field, pin) in [
            ("temperature_pin", &b.temperature_pin),
            ("soil_moisture_pin", &b.soil_moisture_pin),
            ("pump_pin", &b.pump_pin),
        ] {
            if pin.trim().is_empty() {
                errors.push(format!("blynk.{field} is empty"));
            } else if !seen.insert(pin.as_str()) {
                errors.push(format!("blynk.{field} '{pin}' is already used by another pin"));
            }
        }

        if b.request_timeout_ms == 0 {
            errors.push("blynk.request_timeout_ms must be positive".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let p = &self.pump;
        if p.step_delay_ms < MIN_STEP_DELAY_MS {
            errors.push(format!(
                "pump.step_delay_ms must be at least {MIN_STEP_DELAY_MS}, got {}",
                p.step_delay_ms
            ));
        }
        if p.status_revert_ms == 0 {
            errors.push("pump.status_revert_ms must be positive".into());
        }
        if self.poller.interval_ms == 0 {
            errors.push("poller.interval_ms must be positive".into());
        }
    }

    fn validate_readings(&self, errors: &mut Vec<String>) {
        let threshold = self.auto_mode.temperature_threshold;
        if !threshold.is_finite() {
            errors.push(format!(
                "auto_mode.temperature_threshold must be finite, got {threshold}"
            ));
        }
        let fallback = self.poller.fallback_temperature;
        if !fallback.is_finite() {
            errors.push(format!(
                "poller.fallback_temperature must be finite, got {fallback}"
            ));
        }
        let moisture = self.poller.fallback_soil_moisture;
        if !(0.0..=100.0).contains(&moisture) {
            errors.push(format!(
                "poller.fallback_soil_moisture {moisture} out of range [0, 100]"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string. Does not validate.
pub fn parse(contents: &str) -> Result<Config> {
    toml::from_str(contents).context("failed to parse config")
}

/// Read the config file (defaults when it does not exist), apply environment
/// overrides, and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        parse(&contents).with_context(|| format!("in {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
