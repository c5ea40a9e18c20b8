//! SQLite-backed persistence for runs, schedules, and records.
//!
//! All mutations go through conditional single-statement updates or explicit
//! transactions; `rows_affected` is the compare-and-set primitive that gives
//! the scheduler its at-most-once-per-tick guarantee and the run lifecycle
//! its monotone transitions.

mod records;
mod runs;

pub use records::{NewRecord, RecordStore, StoredRecord};
pub use runs::{DueSchedule, ErrorPatch, RunStore, TransitionFields};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::{StoreError, classify};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        root_path TEXT NOT NULL,
        pending_delete INTEGER NOT NULL DEFAULT 0,
        created_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS spiders (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id),
        name TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        UNIQUE (project_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS schedules (
        id TEXT PRIMARY KEY,
        spider_id TEXT NOT NULL REFERENCES spiders(id),
        cron TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        last_fire_ms INTEGER,
        next_fire_ms INTEGER,
        overrides TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (active, next_fire_ms)",
    "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        spider_id TEXT NOT NULL,
        spider_name TEXT NOT NULL,
        schedule_id TEXT,
        state TEXT NOT NULL,
        created_ms INTEGER NOT NULL,
        started_ms INTEGER,
        finished_ms INTEGER,
        items_count INTEGER NOT NULL DEFAULT 0,
        requests_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        output_path TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        pid INTEGER,
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_runs_state ON runs (state, finished_ms)",
    "CREATE INDEX IF NOT EXISTS idx_runs_spider ON runs (spider_id, created_ms)",
    "CREATE TABLE IF NOT EXISTS records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        payload TEXT NOT NULL,
        source_url TEXT,
        acquired_ms INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_run_fp ON records (run_id, fingerprint)",
];

/// Handle to the shared database. Cheap to clone; [`Store::runs`] and
/// [`Store::records`] hand out the component-facing views.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(classify)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory database for tests. The pool must never
    /// drop its one connection or the database vanishes with it.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(classify)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    pub fn runs(&self) -> RunStore {
        RunStore::new(self.pool.clone())
    }

    pub fn records(&self) -> RecordStore {
        RecordStore::new(self.pool.clone())
    }

    /// Close the underlying pool. Every later operation fails with
    /// `Unavailable`; ingest reacts by spilling to backup files.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn dt_to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}
