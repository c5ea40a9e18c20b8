//! End-to-end scenarios: a real store on disk, a real crawl subprocess (a
//! shell stub honoring the crawl-tool argument contract), and the full
//! control plane wired together.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crawlctl_core::{ControlConfig, RunSettings, RunState, Store};
use crawlctl_engine::{EngineHandle, RunEvent, start_control_plane};

const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    data_root: tempfile::TempDir,
    _project_dir: tempfile::TempDir,
    store: Store,
    handle: EngineHandle,
    spider_id: String,
}

/// Shell prologue that extracts the output path from the crawl-tool argument
/// contract: `<tool> crawl <spider> -o <path> --format jsonlines -s K=V...`.
const ARG_PARSE: &str = r#"#!/bin/sh
OUT=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) OUT="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

async fn harness(script_body: &str, tune: impl FnOnce(&mut ControlConfig)) -> Harness {
    let data_root = tempfile::tempdir().unwrap();
    let project_dir = tempfile::tempdir().unwrap();

    let tool = project_dir.path().join("crawl");
    std::fs::write(&tool, format!("{ARG_PARSE}{script_body}\n")).unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut cfg = ControlConfig::new(data_root.path());
    cfg.tail_poll = Duration::from_millis(100);
    cfg.ingest_flush = Duration::from_millis(200);
    cfg.drain_grace = Duration::from_secs(3);
    cfg.shutdown_grace = Duration::from_secs(3);
    cfg.broadcast_interval = Duration::from_millis(100);
    // Keep the periodic layers quiet; tests drive dispatch and rely on the
    // on-demand reconcile push.
    cfg.scheduler_tick = Duration::from_secs(3600);
    cfg.reconcile_interval = Duration::from_secs(3600);
    tune(&mut cfg);

    let store = Store::open(&cfg.db_path()).await.unwrap();
    let runs = store.runs();
    let project = runs.create_project("shop", project_dir.path()).await.unwrap();
    let spider = runs
        .create_spider(
            &project.id,
            "listing",
            &RunSettings {
                crawl_tool: Some(tool),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let handle = start_control_plane(store.clone(), cfg);
    Harness {
        data_root,
        _project_dir: project_dir,
        store,
        handle,
        spider_id: spider.id,
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<RunEvent>,
    mut pred: impl FnMut(&RunEvent) -> bool,
) -> RunEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll the store until the run satisfies `pred` (reconciliation is async).
async fn wait_for_run(
    store: &Store,
    run_id: &str,
    mut pred: impl FnMut(&crawlctl_core::Run) -> bool,
) -> crawlctl_core::Run {
    timeout(WAIT, async {
        loop {
            let run = store.runs().get_run(run_id).await.unwrap();
            if pred(&run) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("timed out waiting for run state")
}

fn finished_run_id(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::RunFinished { run_id, .. } => Some(run_id.clone()),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_three_records_in_order() {
    let hx = harness(
        r#"printf '{"k":1}\n{"k":2}\n{"k":3}\n' >> "$OUT""#,
        |_| {},
    )
    .await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();

    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    let run_id = finished_run_id(&finished).unwrap();

    let run = wait_for_run(&hx.store, &run_id, |run| {
        run.state == RunState::Finished && run.items_count == 3
    })
    .await;
    assert_eq!(run.state, RunState::Finished);
    assert_eq!(run.items_count, 3);
    assert!(run.error_message.is_none());

    let records = hx.store.records().list(&run_id, 0, 10).await.unwrap();
    assert_eq!(records.len(), 3);
    let payloads: Vec<&str> = records.iter().map(|r| r.payload.as_str()).collect();
    assert_eq!(payloads, vec![r#"{"k":1}"#, r#"{"k":2}"#, r#"{"k":3}"#]);
    let distinct: std::collections::HashSet<&str> =
        records.iter().map(|r| r.fingerprint.as_str()).collect();
    assert_eq!(distinct.len(), 3);

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_lines_within_a_run_are_dropped() {
    let hx = harness(
        r#"printf '{"k":1}\n{"k":1}\n{"k":2}\n' >> "$OUT""#,
        |_| {},
    )
    .await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();
    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    let run_id = finished_run_id(&finished).unwrap();

    let run = wait_for_run(&hx.store, &run_id, |run| {
        run.state == RunState::Finished && run.items_count == 2
    })
    .await;
    assert_eq!(run.items_count, 2);
    assert_eq!(hx.store.records().count(&run_id).await.unwrap(), 2);

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_run_without_output_is_rescued() {
    let hx = harness("exit 0", |_| {}).await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();
    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    let run_id = finished_run_id(&finished).unwrap();
    match &finished {
        RunEvent::RunFinished { state, .. } => assert_eq!(*state, RunState::Finished),
        _ => unreachable!(),
    }

    // Reconciliation runs on demand right after finalization and applies the
    // short-run floor.
    let run = wait_for_run(&hx.store, &run_id, |run| run.items_count == 1).await;
    assert_eq!(run.state, RunState::Finished);
    assert_eq!(run.items_count, 1);
    assert_eq!(run.requests_count, 10);

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wall_clock_breach_fails_the_run() {
    let hx = harness("sleep 30", |cfg| {
        cfg.shutdown_grace = Duration::from_secs(2);
    })
    .await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(
            &hx.spider_id,
            RunSettings {
                wall_clock_limit_sec: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    let run_id = finished_run_id(&finished).unwrap();
    let run = hx.store.runs().get_run(&run_id).await.unwrap();
    // The breach classifies the run FAILED even though a record was written;
    // the terminal error names the limit.
    assert_eq!(run.state, RunState::Failed);
    assert!(
        run.error_message
            .as_deref()
            .unwrap_or_default()
            .contains("WallClockExceeded"),
        "unexpected error message: {:?}",
        run.error_message
    );

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caller_cancellation_ends_in_cancelled() {
    let hx = harness("sleep 30", |cfg| {
        cfg.shutdown_grace = Duration::from_secs(2);
    })
    .await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();
    let started = wait_for(&mut events, |e| matches!(e, RunEvent::RunStarted { .. })).await;
    let RunEvent::RunStarted { run_id, .. } = started else {
        unreachable!()
    };

    assert!(hx.handle.stop_run(&run_id).await.unwrap());
    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    match finished {
        RunEvent::RunFinished { state, .. } => assert_eq!(state, RunState::Cancelled),
        _ => unreachable!(),
    }
    let run = hx.store.runs().get_run(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Cancelled);

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_shutdown_cancels_live_runs() {
    let hx = harness("sleep 30", |cfg| {
        cfg.shutdown_grace = Duration::from_secs(2);
    })
    .await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();
    let started = wait_for(&mut events, |e| matches!(e, RunEvent::RunStarted { .. })).await;
    let RunEvent::RunStarted { run_id, .. } = started else {
        unreachable!()
    };

    hx.handle.request_stop();
    timeout(WAIT, hx.handle.wait()).await.unwrap().unwrap();

    let run = hx.store.runs().get_run(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Cancelled);
    assert!(run.finished_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_fire_dispatches_a_run() {
    let hx = harness(r#"printf '{"k":1}\n' >> "$OUT""#, |cfg| {
        cfg.scheduler_tick = Duration::from_millis(200);
    })
    .await;
    let mut events = hx.handle.subscribe();

    let runs = hx.store.runs();
    let schedule = runs
        .create_schedule(&hx.spider_id, "*/5 * * * *", true, &RunSettings::default())
        .await
        .unwrap();
    // Rewind so the schedule is overdue and fires on the next tick.
    let past = chrono::Utc::now() - chrono::Duration::minutes(30);
    runs.advance_schedule(&schedule.id, None, past, Some(past))
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, RunEvent::ScheduleFired { .. })).await;
    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    let run_id = finished_run_id(&finished).unwrap();
    let run = hx.store.runs().get_run(&run_id).await.unwrap();
    assert_eq!(run.schedule_id.as_deref(), Some(schedule.id.as_str()));

    // Fired exactly once: one run for this spider.
    let all = runs.list_runs(&hx.spider_id, 10).await.unwrap();
    assert_eq!(all.len(), 1);

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_ceiling_serializes_runs() {
    let hx = harness(r#"printf '{"k":1}\n' >> "$OUT"; sleep 1"#, |cfg| {
        cfg.max_concurrent_runs = 1;
    })
    .await;
    let mut events = hx.handle.subscribe();

    // A second spider in the same project so only the global ceiling binds.
    let runs = hx.store.runs();
    let spider = runs.get_spider(&hx.spider_id).await.unwrap();
    let other = runs
        .create_spider(&spider.project_id, "detail", &spider.settings)
        .await
        .unwrap();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();
    hx.handle.dispatch(&other.id, RunSettings::default()).await.unwrap();

    // With a global ceiling of one, the second run may only start after the
    // first finished.
    let mut sequence = Vec::new();
    timeout(WAIT, async {
        while sequence.iter().filter(|e| matches!(e, RunEvent::RunFinished { .. })).count() < 2 {
            match events.recv().await {
                Ok(event @ (RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. })) => {
                    sequence.push(event);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for both runs");

    let kinds: Vec<&str> = sequence
        .iter()
        .map(|e| match e {
            RunEvent::RunStarted { .. } => "started",
            RunEvent::RunFinished { .. } => "finished",
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(kinds, vec!["started", "finished", "started", "finished"]);

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_directory_layout_matches_the_contract() {
    let hx = harness(r#"printf '{"k":1}\n' >> "$OUT"; echo progress >&2"#, |_| {}).await;
    let mut events = hx.handle.subscribe();

    hx.handle
        .dispatch(&hx.spider_id, RunSettings::default())
        .await
        .unwrap();
    let finished = wait_for(&mut events, |e| finished_run_id(e).is_some()).await;
    let run_id = finished_run_id(&finished).unwrap();

    let run_dir: PathBuf = hx.data_root.path().join("runs").join(&run_id);
    assert!(run_dir.join("output.jsonl").is_file());
    assert!(run_dir.join("log.txt").is_file());
    let log = std::fs::read_to_string(run_dir.join("log.txt")).unwrap();
    assert!(log.contains("progress"));

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failure_fails_the_run_without_a_subprocess() {
    let hx = harness("exit 0", |_| {}).await;
    let mut events = hx.handle.subscribe();

    // Point the run at a tool that does not exist.
    hx.handle
        .dispatch(
            &hx.spider_id,
            RunSettings {
                crawl_tool: Some(Path::new("/nonexistent/crawl-tool").to_path_buf()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let state_change = wait_for(&mut events, |e| {
        matches!(
            e,
            RunEvent::RunStateChanged {
                state: RunState::Failed,
                ..
            }
        )
    })
    .await;
    let RunEvent::RunStateChanged { run_id, error_message, .. } = state_change else {
        unreachable!()
    };
    assert!(
        error_message.unwrap_or_default().contains("SpawnFailure"),
        "expected a SpawnFailure error"
    );
    let run = hx.store.runs().get_run(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.started_at.is_none());

    hx.handle.request_stop();
    hx.handle.wait().await.unwrap();
}
