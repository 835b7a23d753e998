mod auto_mode;
mod config;
mod debounce;
mod history;
mod pins;
mod poller;
mod sequencer;
mod store;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use auto_mode::{AutoModeEvaluator, AutoModeSettings};
use history::Db;
use pins::{BlynkClient, PinApi};
use poller::{Fallbacks, SensorPins};
use sequencer::Sequencer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        base_url = %cfg.blynk.base_url,
        pump_pin = %cfg.blynk.pump_pin,
        auto_mode = cfg.auto_mode.enabled,
        threshold = cfg.auto_mode.temperature_threshold,
        "config loaded"
    );

    // ── Pin client ──────────────────────────────────────────────────
    let pins = Arc::new(BlynkClient::new(
        &cfg.blynk.base_url,
        &cfg.blynk.token,
        cfg.blynk.request_timeout(),
    ));

    // The remote pin is an edge trigger, so its value says nothing reliable
    // about the pump. Logged only; local state starts as stopped.
    match pins.read_pin(&cfg.blynk.pump_pin).await {
        Ok(value) => info!(pin = %cfg.blynk.pump_pin, value, "remote pump pin at startup"),
        Err(e) => warn!("could not read pump pin at startup: {e}"),
    }

    // ── History ─────────────────────────────────────────────────────
    let history = if cfg.history.enabled {
        let db = Db::connect(&cfg.history.db_url).await?;
        db.migrate().await?;
        info!(db_url = %cfg.history.db_url, "history db ready");
        Some(db)
    } else {
        info!("history disabled");
        None
    };

    // ── Pump state + sequencer ──────────────────────────────────────
    let (writer, _) = store::channel(cfg.pump.status_revert());
    let mut sequencer = Sequencer::new(
        Arc::clone(&pins),
        &cfg.blynk.pump_pin,
        cfg.pump.step_delay(),
        cfg.pump.debounce(),
        writer,
    );
    if let Some(db) = &history {
        let (tx, rx) = mpsc::unbounded_channel();
        sequencer = sequencer.with_reports(tx);
        tokio::spawn(history::record(db.clone(), rx));
    }
    let sequencer = Arc::new(sequencer);

    // ── Sensor poller + auto mode ───────────────────────────────────
    let auto_mode = Arc::new(RwLock::new(AutoModeSettings {
        enabled: cfg.auto_mode.enabled,
        threshold: cfg.auto_mode.temperature_threshold,
    }));
    let (latest_tx, latest_rx) = watch::channel(None);

    tokio::spawn(poller::run(
        Arc::clone(&pins),
        SensorPins {
            temperature: cfg.blynk.temperature_pin.clone(),
            soil_moisture: cfg.blynk.soil_moisture_pin.clone(),
        },
        Fallbacks {
            temperature: cfg.poller.fallback_temperature,
            soil_moisture: cfg.poller.fallback_soil_moisture,
        },
        cfg.poller.interval(),
        Arc::clone(&sequencer),
        AutoModeEvaluator::new(Arc::clone(&auto_mode)),
        latest_tx,
    ));

    // ── Web server ──────────────────────────────────────────────────
    let state = web::AppState {
        sequencer,
        latest: latest_rx,
        auto_mode,
        history,
        started_at: Instant::now(),
    };
    web::serve(state, cfg.web.port).await?;

    info!("controller stopped");
    Ok(())
}
