//! Post-hoc repair of divergence between the run store, the record store,
//! and the on-disk output files.
//!
//! Runs both periodically (recently-terminal sweep) and on demand (every
//! finalized run is pushed onto the channel). All writes go through the run
//! store's conditional terminal repair; applying the same evidence twice
//! yields the same row, so the whole pass is idempotent.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crawlctl_core::fingerprint::{FingerprintSpec, source_url, to_hex};
use crawlctl_core::store::{ErrorPatch, NewRecord};
use crawlctl_core::{ControlConfig, RecordStore, Run, RunState, RunStore, StoreError};

use crate::broadcast::Update;
use crate::stats::{CrawlStats, read_stats, stats_path};

pub(crate) struct Reconciler {
    pub runs: RunStore,
    pub records: RecordStore,
    pub cfg: ControlConfig,
    pub updates: mpsc::Sender<Update>,
}

/// Evidence gathered for one terminal run. `file_items` is the count of
/// distinct records present in the output file, when the file exists.
#[derive(Debug, Default)]
struct Evidence {
    db_records: i64,
    file_items: Option<i64>,
    stats: Option<CrawlStats>,
}

/// The corrective write reconciliation decided on, if any.
#[derive(Debug, PartialEq)]
struct Repair {
    state: RunState,
    items: i64,
    requests: i64,
    error: ErrorPatch,
}

pub(crate) async fn run_reconciler(
    rec: Reconciler,
    mut on_demand: mpsc::Receiver<String>,
    stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(rec.cfg.reconcile_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            run_id = on_demand.recv() => match run_id {
                Some(run_id) => {
                    if let Err(err) = rec.reconcile_run(&run_id).await {
                        warn!(run_id = %run_id, error = %err, "reconcile failed");
                    }
                }
                // All producers gone: the engine is shutting down and every
                // finalization has been drained.
                None => break,
            },
            _ = tick.tick(), if !*stop.borrow() => {
                rec.sweep().await;
            }
        }
    }
    Ok(())
}

impl Reconciler {
    async fn sweep(&self) {
        let window = chrono::Duration::from_std(self.cfg.reconcile_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = Utc::now() - window;
        let candidates = match self.runs.list_recent_terminal(cutoff).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "reconcile sweep: listing candidates failed");
                return;
            }
        };
        debug!(candidates = candidates.len(), "reconcile sweep");
        for run in candidates {
            if let Err(err) = self.reconcile_run(&run.id).await {
                warn!(run_id = %run.id, error = %err, "reconcile failed");
            }
        }
    }

    pub(crate) async fn reconcile_run(&self, run_id: &str) -> Result<(), StoreError> {
        let run = self.runs.get_run(run_id).await?;
        if !run.state.is_terminal() {
            return Ok(());
        }

        self.replay_backups(&run).await?;

        let spec = FingerprintSpec::from_settings(&run.settings);
        let evidence = Evidence {
            db_records: self.records.count(&run.id).await?,
            file_items: count_file_records(&run.output_path, &spec).await,
            stats: read_stats(&stats_path(&run.output_path)).await,
        };

        let Some(repair) = plan_repair(
            &run,
            &evidence,
            self.cfg.short_run_threshold,
            self.cfg.request_floor,
        ) else {
            return Ok(());
        };

        let flipped = repair.state != run.state;
        let applied = self
            .runs
            .repair_terminal(
                &run.id,
                run.state,
                repair.state,
                repair.items,
                repair.requests,
                repair.error.clone(),
            )
            .await?;
        if !applied {
            // The run changed under us; the next pass sees the fresh row.
            return Ok(());
        }

        info!(
            run_id = %run.id,
            from = %run.state,
            to = %repair.state,
            items = repair.items,
            requests = repair.requests,
            "reconciled run"
        );
        if flipped {
            let error_message = match &repair.error {
                ErrorPatch::Keep => run.error_message.clone(),
                ErrorPatch::Clear => None,
                ErrorPatch::Set(message) => Some(message.clone()),
            };
            let _ = self
                .updates
                .send(Update::State {
                    run_id: run.id.clone(),
                    state: repair.state,
                    error_message,
                })
                .await;
        }
        Ok(())
    }

    /// Replay ingest spill files produced while the record store was
    /// unavailable. Fingerprint dedup makes the replay safe to repeat; a
    /// file is deleted only after its whole content is stored.
    async fn replay_backups(&self, run: &Run) -> Result<(), StoreError> {
        let Some(dir) = run.output_path.parent().map(|p| p.join("backup")) else {
            return Ok(());
        };
        let mut files: Vec<PathBuf> = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("ingest-") && name.ends_with(".jsonl") {
                files.push(entry.path());
            }
        }
        files.sort();

        let spec = FingerprintSpec::from_settings(&run.settings);
        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable backup file");
                    continue;
                }
            };

            let mut batch = Vec::new();
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(serde_json::Value::Object(payload)) => {
                        batch.push(NewRecord {
                            fingerprint: to_hex(&spec.fingerprint(&payload)),
                            source_url: source_url(&payload).map(str::to_string),
                            payload: serde_json::Value::Object(payload).to_string(),
                            acquired_at: Utc::now(),
                        });
                    }
                    _ => debug!(path = %path.display(), "skipping malformed backup line"),
                }
            }

            let mut recovered = 0u64;
            for chunk in batch.chunks(500) {
                recovered += self.records.insert_batch(&run.id, chunk).await?;
            }
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "failed to remove replayed backup");
            }
            info!(
                run_id = %run.id,
                path = %path.display(),
                recovered,
                "replayed ingest backup"
            );
        }
        Ok(())
    }
}

fn plan_repair(
    run: &Run,
    evidence: &Evidence,
    short_threshold: Duration,
    request_floor: i64,
) -> Option<Repair> {
    // Exit 0 with an explicit "cancelled" finish reason is a deliberate stop;
    // trust the run as recorded.
    if run.state == RunState::Finished
        && evidence.stats.as_ref().is_some_and(|s| s.was_cancelled())
    {
        return None;
    }

    let short_threshold =
        chrono::Duration::from_std(short_threshold).unwrap_or_else(|_| chrono::Duration::seconds(10));
    let short = run.duration().is_some_and(|d| d < short_threshold);

    let mut items = evidence
        .db_records
        .max(evidence.file_items.unwrap_or(0))
        .max(run.items_count);

    // Stats-file requests are authoritative; the items-plus-overhead floor is
    // only an estimate of last resort, otherwise repeated passes would keep
    // inflating the counter.
    let file_requests = evidence
        .stats
        .as_ref()
        .and_then(|s| s.request_count)
        .unwrap_or(0);
    let estimate = if run.requests_count == 0 && file_requests == 0 {
        items + request_floor
    } else {
        0
    };
    let mut requests = file_requests.max(run.requests_count).max(estimate);

    let mut state = run.state;
    let mut error = ErrorPatch::Keep;

    if run.state == RunState::Finished && items == 0 {
        if short {
            // The spider legitimately completed but its lines were lost to
            // the tail-after-close race; give it the minimum credible floor.
            items = 1;
            requests = requests.max(request_floor);
        } else {
            state = RunState::Failed;
            error = ErrorPatch::Set("finished without producing any records".to_string());
        }
    }
    if items > 0 && run.state == RunState::Failed {
        // The spider did produce data; the failure classification was wrong.
        state = RunState::Finished;
        error = ErrorPatch::Clear;
    }

    if state == run.state && items == run.items_count && requests == run.requests_count {
        return None;
    }
    Some(Repair {
        state,
        items,
        requests,
        error,
    })
}

/// Distinct decodable records in the output file, by fingerprint. Raw line
/// counts would overcount duplicates the ingest pipeline rightly dropped,
/// and a repeated pass would then keep "repairing" an already-correct run.
async fn count_file_records(path: &std::path::Path, spec: &FingerprintSpec) -> Option<i64> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut seen = std::collections::HashSet::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(serde_json::Value::Object(payload)) = serde_json::from_str(line) {
            seen.insert(spec.fingerprint(&payload));
        }
    }
    Some(seen.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlctl_core::store::TransitionFields;
    use crawlctl_core::{RunOrigin, RunSettings, Store};
    use std::path::Path;

    struct Fixture {
        store: Store,
        rec: Reconciler,
        _updates_rx: mpsc::Receiver<Update>,
        runs_root: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        let (updates, updates_rx) = mpsc::channel(64);
        let runs_root = tempfile::tempdir().unwrap();
        let rec = Reconciler {
            runs: store.runs(),
            records: store.records(),
            cfg: ControlConfig::new(runs_root.path()),
            updates,
        };
        Fixture {
            rec,
            _updates_rx: updates_rx,
            runs_root,
            store,
        }
    }

    async fn terminal_run(fx: &Fixture, state: RunState, duration_secs: i64) -> Run {
        let runs = fx.store.runs();
        let project = runs
            .create_project(&format!("p-{}", uuid_suffix()), Path::new("/srv/shop"))
            .await
            .unwrap();
        let spider = runs
            .create_spider(&project.id, "listing", &RunSettings::default())
            .await
            .unwrap();
        let run = runs
            .create_run(
                &spider.id,
                &RunSettings::default(),
                RunOrigin::Manual,
                fx.runs_root.path(),
            )
            .await
            .unwrap();

        let started = Utc::now() - chrono::Duration::seconds(duration_secs + 60);
        runs.transition(
            &run.id,
            RunState::Pending,
            RunState::Running,
            TransitionFields {
                started_at: Some(started),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        runs.transition(
            &run.id,
            RunState::Running,
            state,
            TransitionFields {
                finished_at: Some(started + chrono::Duration::seconds(duration_secs)),
                error_message: (state == RunState::Failed).then(|| "exit code 2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        runs.get_run(&run.id).await.unwrap()
    }

    fn uuid_suffix() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static N: AtomicU32 = AtomicU32::new(0);
        N.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn write_output(run: &Run, lines: &[&str]) {
        std::fs::create_dir_all(run.output_path.parent().unwrap()).unwrap();
        std::fs::write(&run.output_path, lines.join("\n") + "\n").unwrap();
    }

    #[tokio::test]
    async fn short_run_rescue_is_idempotent() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Finished, 3).await;

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let once = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(once.state, RunState::Finished);
        assert_eq!(once.items_count, 1);
        assert_eq!(once.requests_count, 10);

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let twice = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(
            (twice.state, twice.items_count, twice.requests_count),
            (once.state, once.items_count, once.requests_count)
        );
    }

    #[tokio::test]
    async fn failed_run_with_output_evidence_flips_to_finished() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Failed, 60).await;
        write_output(&run, &[r#"{"k":1}"#, r#"{"k":2}"#, r#"{"k":3}"#]);

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let repaired = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(repaired.state, RunState::Finished);
        assert_eq!(repaired.items_count, 3);
        assert_eq!(repaired.requests_count, 13);
        assert_eq!(repaired.error_message, None);

        // Idempotent.
        fx.rec.reconcile_run(&run.id).await.unwrap();
        let again = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(again.items_count, 3);
        assert_eq!(again.requests_count, 13);
    }

    #[tokio::test]
    async fn duplicate_file_lines_do_not_inflate_counters() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Finished, 60).await;
        // Three lines on disk, two distinct records; ingest already stored
        // and counted both.
        write_output(&run, &[r#"{"k":1}"#, r#"{"k":1}"#, r#"{"k":2}"#]);
        let spec = FingerprintSpec::from_settings(&RunSettings::default());
        for raw in [r#"{"k":1}"#, r#"{"k":2}"#] {
            let payload: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(raw).unwrap();
            fx.store
                .records()
                .insert_batch(
                    &run.id,
                    &[NewRecord {
                        fingerprint: to_hex(&spec.fingerprint(&payload)),
                        payload: raw.to_string(),
                        source_url: None,
                        acquired_at: Utc::now(),
                    }],
                )
                .await
                .unwrap();
        }
        fx.store.runs().bump_counters(&run.id, 2, 0, 0).await.unwrap();

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let after = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(after.items_count, 2);
    }

    #[tokio::test]
    async fn long_finished_run_without_records_flips_to_failed() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Finished, 120).await;

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let repaired = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(repaired.state, RunState::Failed);
        assert!(repaired.error_message.unwrap().contains("without producing"));
    }

    #[tokio::test]
    async fn cancelled_finish_reason_leaves_the_run_untouched() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Finished, 3).await;
        std::fs::create_dir_all(run.output_path.parent().unwrap()).unwrap();
        std::fs::write(
            stats_path(&run.output_path),
            r#"{"finish_reason": "cancelled"}"#,
        )
        .unwrap();

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let after = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(after.state, RunState::Finished);
        assert_eq!(after.items_count, 0);
        assert_eq!(after.requests_count, 0);
    }

    #[tokio::test]
    async fn stats_file_requests_are_authoritative() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Finished, 60).await;
        write_output(&run, &[r#"{"k":1}"#, r#"{"k":2}"#]);
        std::fs::write(
            stats_path(&run.output_path),
            r#"{"item_scraped_count": 2, "downloader/request_count": 7, "finish_reason": "finished"}"#,
        )
        .unwrap();

        fx.rec.reconcile_run(&run.id).await.unwrap();
        let after = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(after.items_count, 2);
        // Stats value wins over the items-plus-overhead estimate.
        assert_eq!(after.requests_count, 7);
    }

    #[tokio::test]
    async fn backup_files_are_replayed_without_duplicates() {
        let fx = fixture().await;
        let run = terminal_run(&fx, RunState::Finished, 60).await;
        write_output(&run, &[r#"{"k":1}"#, r#"{"k":2}"#, r#"{"k":3}"#]);

        // {"k":3} also reached the store before the outage; the spill holds
        // the rest.
        let spec = FingerprintSpec::from_settings(&RunSettings::default());
        let payload: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"k":3}"#).unwrap();
        fx.store
            .records()
            .insert_batch(
                &run.id,
                &[NewRecord {
                    fingerprint: to_hex(&spec.fingerprint(&payload)),
                    payload: r#"{"k":3}"#.to_string(),
                    source_url: None,
                    acquired_at: Utc::now(),
                }],
            )
            .await
            .unwrap();

        let backup_dir = run.output_path.parent().unwrap().join("backup");
        std::fs::create_dir_all(&backup_dir).unwrap();
        std::fs::write(
            backup_dir.join("ingest-0000.jsonl"),
            "{\"k\":1}\n{\"k\":2}\n{\"k\":3}\n",
        )
        .unwrap();

        fx.rec.reconcile_run(&run.id).await.unwrap();
        assert_eq!(fx.store.records().count(&run.id).await.unwrap(), 3);
        let after = fx.store.runs().get_run(&run.id).await.unwrap();
        assert_eq!(after.items_count, 3);
        // Replayed files are consumed.
        assert!(!backup_dir.join("ingest-0000.jsonl").exists());

        // Replaying again changes nothing.
        fx.rec.reconcile_run(&run.id).await.unwrap();
        assert_eq!(fx.store.records().count(&run.id).await.unwrap(), 3);
    }

    #[test]
    fn plan_repair_reports_no_change_for_settled_runs() {
        let run = Run {
            id: "r".to_string(),
            project_id: "p".to_string(),
            spider_id: "s".to_string(),
            spider_name: "listing".to_string(),
            schedule_id: None,
            state: RunState::Finished,
            created_at: Utc::now(),
            started_at: Some(Utc::now() - chrono::Duration::seconds(90)),
            finished_at: Some(Utc::now() - chrono::Duration::seconds(30)),
            items_count: 5,
            requests_count: 20,
            error_count: 0,
            output_path: "/nonexistent/output.jsonl".into(),
            settings: RunSettings::default(),
            pid: None,
            error_message: None,
        };
        let evidence = Evidence {
            db_records: 5,
            file_items: Some(5),
            stats: None,
        };
        assert_eq!(
            plan_repair(&run, &evidence, Duration::from_secs(10), 10),
            None
        );
    }
}
