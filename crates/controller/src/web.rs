//! HTTP surface for dashboards: pump status, a live pump event stream, the
//! manual toggle, auto-mode settings, and irrigation history.

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::auto_mode::{AutoModeSettings, SharedSettings};
use crate::history::{Db, IrrigationEvent, PumpCommandRecord};
use crate::pins::PinApi;
use crate::poller::SensorReading;
use crate::sequencer::{Sequencer, ToggleOutcome};
use crate::store::PumpState;

const INDEX_HTML: &str = include_str!("ui/index.html");

const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState<P> {
    pub sequencer: Arc<Sequencer<P>>,
    pub latest: watch::Receiver<Option<SensorReading>>,
    pub auto_mode: SharedSettings,
    pub history: Option<Db>,
    pub started_at: Instant,
}

// Derive would demand `P: Clone`.
impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            sequencer: Arc::clone(&self.sequencer),
            latest: self.latest.clone(),
            auto_mode: Arc::clone(&self.auto_mode),
            history: self.history.clone(),
            started_at: self.started_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    pump: PumpState,
    reading: Option<SensorReading>,
    auto_mode: AutoModeSettings,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct ToggleResponse {
    outcome: ToggleOutcome,
    pump: PumpState,
}

#[derive(Debug, Default, Deserialize)]
struct AutoModeUpdate {
    enabled: Option<bool>,
    threshold: Option<f64>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    pump_commands: Vec<PumpCommandRecord>,
    irrigation_events: Vec<IrrigationEvent>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<P: PinApi>(state: AppState<P>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status::<P>))
        .route("/api/events", get(api_events::<P>))
        .route("/api/pump/toggle", post(api_toggle::<P>))
        .route(
            "/api/auto-mode",
            get(api_auto_mode_get::<P>).put(api_auto_mode_put::<P>),
        )
        .route("/api/history", get(api_history::<P>))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status<P: PinApi>(State(state): State<AppState<P>>) -> Json<StatusResponse> {
    let reading = state.latest.borrow().clone();
    Json(StatusResponse {
        pump: state.sequencer.state().snapshot().await,
        reading,
        auto_mode: *state.auto_mode.read().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Server-sent `pump` events: the current state, then every update in the
/// order the store published it.
async fn api_events<P: PinApi>(
    State(state): State<AppState<P>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (initial, updates) = state.sequencer.state().subscribe().await;
    let updates = BroadcastStream::new(updates).filter_map(|update| match update {
        Ok(pump) => Some(pump),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event subscriber lagged, dropping updates");
            None
        }
    });
    let events = tokio_stream::once(initial)
        .chain(updates)
        .map(|pump| Event::default().event("pump").json_data(&pump));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn api_toggle<P: PinApi>(State(state): State<AppState<P>>) -> Response {
    let outcome = state.sequencer.manual_toggle().await;
    let code = match outcome {
        ToggleOutcome::Started | ToggleOutcome::Stopped | ToggleOutcome::AlreadyInState => {
            StatusCode::OK
        }
        ToggleOutcome::Debounced => StatusCode::TOO_MANY_REQUESTS,
        ToggleOutcome::AlreadyProcessing => StatusCode::CONFLICT,
        ToggleOutcome::Failed => StatusCode::BAD_GATEWAY,
    };
    let pump = state.sequencer.state().snapshot().await;
    (code, Json(ToggleResponse { outcome, pump })).into_response()
}

async fn api_auto_mode_get<P: PinApi>(State(state): State<AppState<P>>) -> Json<AutoModeSettings> {
    Json(*state.auto_mode.read().await)
}

async fn api_auto_mode_put<P: PinApi>(
    State(state): State<AppState<P>>,
    Json(update): Json<AutoModeUpdate>,
) -> Response {
    let mut settings = state.auto_mode.write().await;
    match apply_update(*settings, &update) {
        Ok(next) => {
            *settings = next;
            info!(enabled = next.enabled, threshold = next.threshold, "auto mode updated");
            Json(next).into_response()
        }
        Err(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
    }
}

fn apply_update(current: AutoModeSettings, update: &AutoModeUpdate) -> Result<AutoModeSettings, String> {
    let mut next = current;
    if let Some(enabled) = update.enabled {
        next.enabled = enabled;
    }
    if let Some(threshold) = update.threshold {
        if !threshold.is_finite() {
            return Err(format!("threshold must be a finite number, got {threshold}"));
        }
        next.threshold = threshold;
    }
    Ok(next)
}

async fn api_history<P: PinApi>(
    State(state): State<AppState<P>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(db) = &state.history else {
        return Json(HistoryResponse {
            pump_commands: Vec::new(),
            irrigation_events: Vec::new(),
        })
        .into_response();
    };

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let result = async {
        let pump_commands = db.recent_pump_commands(limit).await?;
        let irrigation_events = db.recent_irrigation_events(limit).await?;
        anyhow::Ok(HistoryResponse {
            pump_commands,
            irrigation_events,
        })
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            error!("history query failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "history unavailable" })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<P: PinApi>(state: AppState<P>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ===========================================================================
// Tests
// ===========================================================================
