//! Client for the cloud pin API. Every virtual pin holds one scalar: reads go
//! through `<base>/get`, writes through `<base>/update`, both plain GETs with
//! the device token in the query string.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Commands & errors
// ---------------------------------------------------------------------------

/// Value written to the pump control pin. The firmware reacts to the
/// `Off` → `On` edge, not to the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpCommand {
    Off,
    On,
}

impl PumpCommand {
    pub fn value(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }
}

impl fmt::Display for PumpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::On => write!(f, "ON"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PinError {
    /// Transport failure, timeout, or a non-2xx response.
    #[error("pin {pin} unavailable: {reason}")]
    RemoteUnavailable { pin: String, reason: String },
}

// ---------------------------------------------------------------------------
// Pin API seam
// ---------------------------------------------------------------------------

/// Read/write access to the virtual pins.
///
/// `read_pin` reports failures so the caller can pick a fallback value.
/// `write_pin` folds every failure into `false` so a multi-step sequence can
/// stop at the failing step without unwinding through error types.
pub trait PinApi: Send + Sync + 'static {
    fn read_pin(&self, pin: &str) -> impl Future<Output = Result<f64, PinError>> + Send;

    fn write_pin(&self, pin: &str, value: i64) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Cloud pin API over HTTP. Requests are blocking `ureq` calls moved onto
/// tokio's blocking pool.
#[derive(Clone)]
pub struct BlynkClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl BlynkClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Issue `GET <base>/<endpoint>?token=..&pin=..[&value=..]` and return the
    /// body. Any non-2xx status surfaces as an error from ureq.
    async fn fetch(&self, endpoint: &'static str, pin: &str, value: Option<i64>) -> Result<String, String> {
        let agent = self.agent.clone();
        let url = format!("{}/{endpoint}", self.base_url);
        let token = self.token.clone();
        let pin = pin.to_string();

        tokio::task::spawn_blocking(move || {
            let mut request = agent
                .get(&url)
                .query("token", &token)
                .query("pin", &pin);
            if let Some(v) = value {
                request = request.query("value", v.to_string());
            }
            let mut response = request.call().map_err(|e| e.to_string())?;
            response
                .body_mut()
                .read_to_string()
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("request task failed: {e}"))?
    }
}

impl PinApi for BlynkClient {
    async fn read_pin(&self, pin: &str) -> Result<f64, PinError> {
        let body = self
            .fetch("get", pin, None)
            .await
            .map_err(|reason| PinError::RemoteUnavailable {
                pin: pin.to_string(),
                reason,
            })?;
        let value = parse_pin_value(&body);
        debug!(pin, value, "pin read");
        Ok(value)
    }

    async fn write_pin(&self, pin: &str, value: i64) -> bool {
        match self.fetch("update", pin, Some(value)).await {
            Ok(_) => {
                debug!(pin, value, "pin written");
                true
            }
            Err(e) => {
                warn!(pin, value, "pin write failed: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Body parsing
// ---------------------------------------------------------------------------

/// Coerce a `/get` response body into a number.
///
/// The API answers either with a JSON array of values (first one wins) or a
/// bare scalar, and values may arrive as strings. Anything unparsable is 0.
pub fn parse_pin_value(body: &str) -> f64 {
    let trimmed = body.trim();
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items.into_iter().next(),
        Ok(v) => Some(v),
        Err(_) => Some(Value::String(trimmed.to_string())),
    };

    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if b { 1.0 } else { 0.0 }),
        _ => None,
    };

    number.filter(|v| v.is_finite()).unwrap_or(0.0)
}

// ===========================================================================
// In-memory pin API for tests
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_pin_value ----------------------------------------------------

    #[test]
    fn parse_bare_number() {
        assert_eq!(parse_pin_value("38.5"), 38.5);
    }

    #[test]
    fn parse_bare_integer_with_whitespace() {
        assert_eq!(parse_pin_value("  1\n"), 1.0);
    }

    #[test]
    fn parse_array_takes_first_element() {
        assert_eq!(parse_pin_value("[42, 7]"), 42.0);
    }

    #[test]
    fn parse_array_of_strings() {
        assert_eq!(parse_pin_value(r#"["27.3"]"#), 27.3);
    }

    #[test]
    fn parse_quoted_string() {
        assert_eq!(parse_pin_value(r#""61""#), 61.0);
    }

    #[test]
    fn parse_empty_array_is_zero() {
        assert_eq!(parse_pin_value("[]"), 0.0);
    }

    #[test]
    fn parse_null_is_zero() {
        assert_eq!(parse_pin_value("null"), 0.0);
    }

    #[test]
    fn parse_garbage_is_zero() {
        assert_eq!(parse_pin_value("Invalid token."), 0.0);
        assert_eq!(parse_pin_value(""), 0.0);
    }

    #[test]
    fn parse_non_finite_is_zero() {
        assert_eq!(parse_pin_value("NaN"), 0.0);
        assert_eq!(parse_pin_value(r#"["inf"]"#), 0.0);
    }

    #[test]
    fn parse_object_is_zero() {
        assert_eq!(parse_pin_value(r#"{"value": 3}"#), 0.0);
    }

    // -- PumpCommand ----------------------------------------------------------

    #[test]
    fn pump_command_values() {
        assert_eq!(PumpCommand::Off.value(), 0);
        assert_eq!(PumpCommand::On.value(), 1);
        assert_eq!(PumpCommand::On.to_string(), "ON");
    }

    // -- BlynkClient ----------------------------------------------------------

    #[test]
    fn client_trims_trailing_slash() {
        let client = BlynkClient::new("http://127.0.0.1:9/external/api/", "t", Duration::from_secs(1));
        assert_eq!(client.base_url, "http://127.0.0.1:9/external/api");
    }

    #[tokio::test]
    async fn unreachable_host_read_is_remote_unavailable() {
        // Port 9 (discard) is not listening on the loopback in CI.
        let client = BlynkClient::new("http://127.0.0.1:9", "t", Duration::from_millis(500));
        let err = client.read_pin("V0").await.unwrap_err();
        assert!(matches!(err, PinError::RemoteUnavailable { ref pin, .. } if pin == "V0"));
    }

    #[tokio::test]
    async fn unreachable_host_write_returns_false() {
        let client = BlynkClient::new("http://127.0.0.1:9", "t", Duration::from_millis(500));
        assert!(!client.write_pin("V2", 1).await);
    }
}
