//! Per-run ingest pipeline: decodes tailed lines, fingerprints and
//! deduplicates records, batches writes to the record store, and keeps run
//! counters current.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crawlctl_core::error::backoff_delay;
use crawlctl_core::fingerprint::{Fingerprint, FingerprintSpec, source_url, to_hex};
use crawlctl_core::store::NewRecord;
use crawlctl_core::{RecordStore, RunStore, StoreError};

use crate::broadcast::Update;
use crate::tailer::TailEvent;

#[derive(Debug, Clone)]
pub(crate) struct IngestConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retries: u32,
}

/// What the pipeline saw, handed back to the worker at end-of-run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IngestSummary {
    /// Distinct records actually inserted.
    pub inserted: i64,
    /// Lines that failed to decode as a JSON object.
    pub malformed: i64,
    /// At least one batch was spilled to a backup file.
    pub degraded: bool,
}

pub(crate) struct IngestPipeline {
    run_id: String,
    spec: FingerprintSpec,
    runs: RunStore,
    records: RecordStore,
    updates: mpsc::Sender<Update>,
    backup_dir: PathBuf,
    cfg: IngestConfig,

    seen: HashSet<Fingerprint>,
    buffer: Vec<NewRecord>,
    pending_errors: i64,
    backup_seq: u32,
    summary: IngestSummary,
    total_errors: i64,
}

impl IngestPipeline {
    pub(crate) fn new(
        run_id: String,
        spec: FingerprintSpec,
        runs: RunStore,
        records: RecordStore,
        updates: mpsc::Sender<Update>,
        backup_dir: PathBuf,
        cfg: IngestConfig,
    ) -> Self {
        Self {
            run_id,
            spec,
            runs,
            records,
            updates,
            backup_dir,
            cfg,
            seen: HashSet::new(),
            buffer: Vec::new(),
            pending_errors: 0,
            backup_seq: 0,
            summary: IngestSummary::default(),
            total_errors: 0,
        }
    }

    /// Consume tail events until the channel closes (end-of-run), then flush
    /// whatever is buffered.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<TailEvent>) -> IngestSummary {
        let mut flush_tick = tokio::time::interval(self.cfg.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(TailEvent::Line(line)) => {
                        self.handle_line(&line);
                        if self.buffer.len() >= self.cfg.batch_size {
                            self.flush().await;
                        }
                    }
                    Some(TailEvent::FileVanished) => {
                        let _ = self.updates.send(Update::OutputVanished {
                            run_id: self.run_id.clone(),
                        }).await;
                    }
                    Some(TailEvent::NoOutputTimeout) => {
                        let _ = self.updates.send(Update::OutputMissing {
                            run_id: self.run_id.clone(),
                        }).await;
                    }
                    None => break,
                },
                _ = flush_tick.tick() => {
                    if !self.buffer.is_empty() || self.pending_errors > 0 {
                        self.flush().await;
                    }
                }
            }
        }

        self.flush().await;
        self.summary
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let payload = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                self.summary.malformed += 1;
                self.pending_errors += 1;
                warn!(
                    run_id = %self.run_id,
                    line = %truncate(line, 160),
                    "dropping malformed record line"
                );
                return;
            }
        };

        let fingerprint = self.spec.fingerprint(&payload);
        if !self.seen.insert(fingerprint) {
            // Same-run duplicate; the store-level index is the backstop.
            return;
        }
        self.buffer.push(NewRecord {
            fingerprint: to_hex(&fingerprint),
            source_url: source_url(&payload).map(str::to_string),
            payload: serde_json::Value::Object(payload).to_string(),
            acquired_at: Utc::now(),
        });
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() && self.pending_errors == 0 {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let errors = std::mem::take(&mut self.pending_errors);

        match self.insert_with_retry(&batch).await {
            Ok(inserted) => {
                self.summary.inserted += inserted as i64;
                self.total_errors += errors;
                if let Err(err) = self
                    .runs
                    .bump_counters(&self.run_id, inserted as i64, 0, errors)
                    .await
                {
                    // Reconciliation trues the counters up later.
                    warn!(run_id = %self.run_id, error = %err, "counter bump failed");
                }
                let _ = self
                    .updates
                    .send(Update::Counters {
                        run_id: self.run_id.clone(),
                        items: self.summary.inserted,
                        requests: 0,
                        errors: self.total_errors,
                    })
                    .await;
            }
            Err(err) => {
                warn!(
                    run_id = %self.run_id,
                    error = %err,
                    lines = batch.len(),
                    "record store write failed; spilling batch to backup"
                );
                self.total_errors += errors;
                self.spill(&batch).await;
            }
        }
    }

    async fn insert_with_retry(&self, batch: &[NewRecord]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut attempt = 0u32;
        loop {
            match self.records.insert_batch(&self.run_id, batch).await {
                Ok(n) => return Ok(n),
                Err(err) if err.is_retryable() && attempt < self.cfg.retries => {
                    debug!(run_id = %self.run_id, attempt, error = %err, "insert retry");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn spill(&mut self, batch: &[NewRecord]) {
        if batch.is_empty() {
            return;
        }
        if !self.summary.degraded {
            self.summary.degraded = true;
            let _ = self
                .updates
                .send(Update::Degraded {
                    run_id: self.run_id.clone(),
                })
                .await;
        }

        let path = self
            .backup_dir
            .join(format!("ingest-{:04}.jsonl", self.backup_seq));
        self.backup_seq += 1;

        let mut body = String::new();
        for record in batch {
            body.push_str(&record.payload);
            body.push('\n');
        }

        let written = async {
            tokio::fs::create_dir_all(&self.backup_dir).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(body.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => debug!(run_id = %self.run_id, path = %path.display(), "spilled batch"),
            Err(err) => warn!(
                run_id = %self.run_id,
                path = %path.display(),
                error = %err,
                "backup spill failed; records for this batch are lost to the store"
            ),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
