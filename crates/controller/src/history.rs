//! Irrigation history: pump sequences and completed runs, persisted to
//! SQLite. Nothing on the pump path waits on this module; the recorder
//! consumes [`SequenceReport`]s from a channel and logs persistence errors.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::sequencer::{Action, SequenceReport, Trigger};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PumpCommandRecord {
    pub id: i64,
    pub ts_start: i64,
    pub ts_end: i64,
    pub action: String,
    pub control_type: String,
    pub result: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct IrrigationEvent {
    pub id: i64,
    pub ts_start: i64,
    pub ts_end: i64,
    pub duration_sec: i64,
    pub started_by: String,
    pub stopped_by: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/history.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // Each in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Pump commands
    // ----------------------------

    pub async fn insert_pump_command(&self, report: &SequenceReport) -> Result<()> {
        let (result, detail) = match report.failure {
            None => ("ok", None),
            Some(f) => ("failed", Some(format!("step {} ({}) failed", f.step, f.command))),
        };
        sqlx::query(
            r#"
            INSERT INTO pump_commands (ts_start, ts_end, action, control_type, result, detail)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report.started_at.unix_timestamp())
        .bind(report.finished_at.unix_timestamp())
        .bind(report.action.as_str())
        .bind(report.trigger.as_str())
        .bind(result)
        .bind(detail)
        .execute(&self.pool)
        .await
        .context("insert_pump_command failed")?;
        Ok(())
    }

    pub async fn recent_pump_commands(&self, limit: i64) -> Result<Vec<PumpCommandRecord>> {
        sqlx::query_as::<_, PumpCommandRecord>(
            r#"
            SELECT id, ts_start, ts_end, action, control_type, result, detail
            FROM pump_commands
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_pump_commands failed")
    }

    // ----------------------------
    // Irrigation events
    // ----------------------------

    pub async fn insert_irrigation_event(
        &self,
        ts_start: i64,
        ts_end: i64,
        started_by: Trigger,
        stopped_by: Trigger,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_events (ts_start, ts_end, duration_sec, started_by, stopped_by)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts_start)
        .bind(ts_end)
        .bind((ts_end - ts_start).max(0))
        .bind(started_by.as_str())
        .bind(stopped_by.as_str())
        .execute(&self.pool)
        .await
        .context("insert_irrigation_event failed")?;
        Ok(())
    }

    pub async fn recent_irrigation_events(&self, limit: i64) -> Result<Vec<IrrigationEvent>> {
        sqlx::query_as::<_, IrrigationEvent>(
            r#"
            SELECT id, ts_start, ts_end, duration_sec, started_by, stopped_by
            FROM irrigation_events
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_irrigation_events failed")
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Pump run currently open (successful start, no successful stop yet).
struct OpenRun {
    started_at: OffsetDateTime,
    started_by: Trigger,
}

/// Consume sequence reports until the sender side is dropped.
pub async fn record(db: Db, mut reports: mpsc::UnboundedReceiver<SequenceReport>) {
    info!("history recorder started");
    let mut open_run: Option<OpenRun> = None;
    while let Some(report) = reports.recv().await {
        if let Err(e) = handle_report(&db, &mut open_run, &report).await {
            error!(action = report.action.as_str(), "history: {e:#}");
        }
    }
}

async fn handle_report(db: &Db, open_run: &mut Option<OpenRun>, report: &SequenceReport) -> Result<()> {
    db.insert_pump_command(report).await?;

    if report.failure.is_some() {
        return Ok(());
    }

    match report.action {
        Action::Start => {
            *open_run = Some(OpenRun {
                started_at: report.finished_at,
                started_by: report.trigger,
            });
        }
        Action::Stop => {
            // A stop without a recorded start (e.g. after a restart) has no
            // run to close.
            if let Some(run) = open_run.take() {
                db.insert_irrigation_event(
                    run.started_at.unix_timestamp(),
                    report.finished_at.unix_timestamp(),
                    run.started_by,
                    report.trigger,
                )
                .await?;
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::PumpCommand;
    use crate::sequencer::StepFailure;
    use time::Duration;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn report(action: Action, trigger: Trigger, at: i64, failure: Option<StepFailure>) -> SequenceReport {
        let started_at = OffsetDateTime::from_unix_timestamp(at).unwrap();
        SequenceReport {
            action,
            trigger,
            started_at,
            finished_at: started_at + Duration::seconds(1),
            failure,
        }
    }

    #[tokio::test]
    async fn pump_commands_round_trip() {
        let db = memory_db().await;
        db.insert_pump_command(&report(Action::Start, Trigger::Auto, 1_700_000_000, None))
            .await
            .unwrap();
        db.insert_pump_command(&report(
            Action::Stop,
            Trigger::Manual,
            1_700_000_100,
            Some(StepFailure {
                step: 2,
                command: PumpCommand::On,
            }),
        ))
        .await
        .unwrap();

        let rows = db.recent_pump_commands(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first.
        assert_eq!(rows[0].action, "stop");
        assert_eq!(rows[0].control_type, "MANUAL");
        assert_eq!(rows[0].result, "failed");
        assert_eq!(rows[0].detail.as_deref(), Some("step 2 (ON) failed"));
        assert_eq!(rows[1].control_type, "AUTOMATIC");
        assert_eq!(rows[1].result, "ok");
        assert!(rows[1].detail.is_none());
    }

    #[tokio::test]
    async fn recent_pump_commands_respects_limit() {
        let db = memory_db().await;
        for i in 0..5 {
            db.insert_pump_command(&report(Action::Start, Trigger::Manual, 1_700_000_000 + i, None))
                .await
                .unwrap();
        }
        assert_eq!(db.recent_pump_commands(3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn start_then_stop_records_irrigation_event() {
        let db = memory_db().await;
        let mut open = None;

        handle_report(&db, &mut open, &report(Action::Start, Trigger::Auto, 1_700_000_000, None))
            .await
            .unwrap();
        assert!(open.is_some());
        handle_report(&db, &mut open, &report(Action::Stop, Trigger::Manual, 1_700_000_600, None))
            .await
            .unwrap();
        assert!(open.is_none());

        let events = db.recent_irrigation_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].started_by, "AUTOMATIC");
        assert_eq!(events[0].stopped_by, "MANUAL");
        assert_eq!(events[0].duration_sec, 600);
    }

    #[tokio::test]
    async fn failed_stop_keeps_run_open() {
        let db = memory_db().await;
        let mut open = None;
        let failure = Some(StepFailure {
            step: 1,
            command: PumpCommand::Off,
        });

        handle_report(&db, &mut open, &report(Action::Start, Trigger::Manual, 1_700_000_000, None))
            .await
            .unwrap();
        handle_report(&db, &mut open, &report(Action::Stop, Trigger::Manual, 1_700_000_050, failure))
            .await
            .unwrap();

        assert!(open.is_some());
        assert!(db.recent_irrigation_events(10).await.unwrap().is_empty());
        assert_eq!(db.recent_pump_commands(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_without_start_records_no_event() {
        let db = memory_db().await;
        let mut open = None;
        handle_report(&db, &mut open, &report(Action::Stop, Trigger::Manual, 1_700_000_000, None))
            .await
            .unwrap();
        assert!(db.recent_irrigation_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recorder_drains_channel_until_closed() {
        let db = memory_db().await;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(report(Action::Start, Trigger::Manual, 1_700_000_000, None))
            .unwrap();
        tx.send(report(Action::Stop, Trigger::Manual, 1_700_000_030, None))
            .unwrap();
        drop(tx);

        record(db.clone(), rx).await;

        assert_eq!(db.recent_pump_commands(10).await.unwrap().len(), 2);
        assert_eq!(db.recent_irrigation_events(10).await.unwrap().len(), 1);
    }
}
