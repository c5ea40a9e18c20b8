use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use crate::error::{StoreError, classify};
use crate::store::{dt_to_ms, ms_to_dt};

/// A decoded record ready for insertion.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub fingerprint: String,
    pub payload: String,
    pub source_url: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

/// A stored record, in insertion order within its run.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub seq: i64,
    pub run_id: String,
    pub fingerprint: String,
    pub payload: String,
    pub source_url: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

/// Record Store: deduplicated structured records keyed by run.
///
/// Uniqueness on `(run_id, fingerprint)` is enforced by index; duplicate
/// inserts are silently skipped and excluded from the returned count.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch atomically, skipping records whose fingerprint is
    /// already present for the run. Returns the number actually inserted.
    pub async fn insert_batch(
        &self,
        run_id: &str,
        records: &[NewRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let mut inserted = 0u64;
        for record in records {
            let res = sqlx::query(
                "INSERT OR IGNORE INTO records (run_id, fingerprint, payload, source_url, acquired_ms)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(&record.fingerprint)
            .bind(&record.payload)
            .bind(&record.source_url)
            .bind(dt_to_ms(record.acquired_at))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
            inserted += res.rows_affected();
        }
        tx.commit().await.map_err(classify)?;
        Ok(inserted)
    }

    pub async fn count(&self, run_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        row.try_get("n").map_err(classify)
    }

    pub async fn list(
        &self,
        run_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM records WHERE run_id = ? ORDER BY seq LIMIT ? OFFSET ?",
        )
        .bind(run_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(record_from_row).collect()
    }

    /// Drop all records for a run (GC after run deletion).
    pub async fn purge(&self, run_id: &str) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM records WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<StoredRecord, StoreError> {
    Ok(StoredRecord {
        seq: row.try_get("seq").map_err(classify)?,
        run_id: row.try_get("run_id").map_err(classify)?,
        fingerprint: row.try_get("fingerprint").map_err(classify)?,
        payload: row.try_get("payload").map_err(classify)?,
        source_url: row.try_get("source_url").map_err(classify)?,
        acquired_at: ms_to_dt(row.try_get("acquired_ms").map_err(classify)?)?,
    })
}
