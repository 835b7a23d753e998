//! Local stand-in for the cloud pin API. Serves the same `get` / `update`
//! endpoints the controller calls and drives a simulated device behind them.

mod sim;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::{env, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{DeviceSim, PinNames, Scenario, WriteResult};

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<DeviceSim>>,
    token: Arc<str>,
    /// Answer reads with `[value]` instead of a bare number.
    array_body: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let port: u16 = env_or("SIM_PORT", 9090);
    let token = env::var("BLYNK_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let tick_ms: u64 = env_or("SIM_TICK_MS", 1000).max(1);
    let day_s: f64 = env_or("SIM_DAY_S", 600.0);
    let array_body = env::var("SIM_ARRAY_BODY")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let device = Arc::new(Mutex::new(DeviceSim::new(
        scenario,
        PinNames::default(),
        day_s,
    )));

    // Simulated time advances with wall-clock time.
    let ticker = Arc::clone(&device);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        loop {
            interval.tick().await;
            let mut d = ticker.lock().await;
            d.tick(tick_ms as f64 / 1000.0);
            debug!(
                temperature = d.true_temperature(),
                soil_moisture = d.soil_moisture(),
                pump_running = d.pump_running(),
                "tick"
            );
        }
    });

    let state = AppState {
        device,
        token: token.into(),
        array_body,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        %addr,
        scenario = %scenario,
        tick_ms,
        day_s,
        "pin simulator listening on http://{addr}/external/api"
    );

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(state: AppState) -> Router {
    Router::new()
        .route("/external/api/get", get(api_get))
        .route("/external/api/update", get(api_update))
        .with_state(state)
}

fn bad_request(msg: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

/// Token and pin checks shared by both endpoints.
fn check<'a>(state: &AppState, q: &'a HashMap<String, String>) -> Result<&'a str, Response> {
    if q.get("token").map(String::as_str) != Some(&*state.token) {
        return Err(bad_request("Invalid token."));
    }
    match q.get("pin") {
        Some(pin) if !pin.is_empty() => Ok(pin.as_str()),
        _ => Err(bad_request("Pin is missing.")),
    }
}

async fn api_get(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let pin = match check(&state, &q) {
        Ok(pin) => pin,
        Err(resp) => return resp,
    };

    let device = state.device.lock().await;
    if device.read_fails() {
        warn!(pin, "simulated read failure");
        return (StatusCode::SERVICE_UNAVAILABLE, "Device offline.").into_response();
    }
    let Some(value) = device.read(pin) else {
        return bad_request("Invalid pin.");
    };
    drop(device);

    debug!(pin, value, "read");
    let body = if state.array_body {
        serde_json::json!([value.to_string()]).to_string()
    } else {
        value.to_string()
    };
    (StatusCode::OK, body).into_response()
}

async fn api_update(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let pin = match check(&state, &q) {
        Ok(pin) => pin,
        Err(resp) => return resp,
    };
    let Some(value) = q.get("value").and_then(|v| v.trim().parse::<f64>().ok()) else {
        return bad_request("Invalid value.");
    };

    match state.device.lock().await.write(pin, value) {
        Some(WriteResult::PumpToggled(running)) => {
            info!(pin, running, "pump toggled by edge");
            StatusCode::OK.into_response()
        }
        Some(WriteResult::Stored) => {
            debug!(pin, value, "write");
            StatusCode::OK.into_response()
        }
        None => bad_request("Invalid pin."),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
