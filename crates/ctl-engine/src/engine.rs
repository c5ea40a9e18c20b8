//! Top-level control-plane runtime: spawns every component as a named task,
//! republishes status snapshots, and tears the plane down in
//! dependency-reverse order on stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crawlctl_core::{ControlConfig, Store};

use crate::api::{ActiveRunSnapshot, EngineHandle, EngineInner, RunEvent, StatusSnapshot};
use crate::broadcast::run_broadcaster;
use crate::dispatch::{DispatcherConfig, run_dispatcher};
use crate::queue::{DispatchQueue as _, InMemoryQueue};
use crate::reconcile::{Reconciler, run_reconciler};
use crate::scheduler::run_scheduler;
use crate::supervisor::{Supervisor, SupervisorHandle};

pub(crate) fn start(store: Store, cfg: ControlConfig) -> EngineHandle {
    let (event_tx, _) = broadcast::channel::<RunEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
    let queue = Arc::new(InMemoryQueue::new());
    let (supervisor_tx, supervisor_rx) = mpsc::channel(64);

    let inner = Arc::new(EngineInner::new(
        event_tx,
        snapshot_rx,
        queue,
        supervisor_tx,
        store.runs(),
    ));

    let join = tokio::spawn(run_control_plane(
        inner.clone(),
        snapshot_tx,
        store,
        cfg,
        supervisor_rx,
    ));
    EngineHandle { inner, join }
}

async fn run_control_plane(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    store: Store,
    cfg: ControlConfig,
    supervisor_rx: mpsc::Receiver<crate::supervisor::SupervisorCommand>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(cfg.runs_root()).await?;

    let (updates_tx, updates_rx) = mpsc::channel(1024);
    let (reconcile_tx, reconcile_rx) = mpsc::channel(256);
    let (stop_tx, stop_rx) = watch::channel(false);

    let broadcaster = tokio::spawn(run_broadcaster(
        updates_rx,
        inner.event_tx.clone(),
        cfg.broadcast_interval,
    ));
    let supervisor = tokio::spawn(
        Supervisor::new(
            store.runs(),
            store.records(),
            cfg.clone(),
            updates_tx.clone(),
            reconcile_tx.clone(),
        )
        .run(supervisor_rx, stop_rx.clone()),
    );
    let scheduler = tokio::spawn(run_scheduler(
        store.runs(),
        inner.queue.clone(),
        updates_tx.clone(),
        cfg.scheduler_tick,
        stop_rx.clone(),
    ));
    let dispatcher = tokio::spawn(run_dispatcher(
        inner.queue.clone(),
        SupervisorHandle {
            tx: inner.supervisor_tx.clone(),
        },
        DispatcherConfig {
            max_concurrent_runs: cfg.max_concurrent_runs,
            max_per_spider: cfg.max_per_spider,
            max_per_project: cfg.max_per_project,
            max_requeue: cfg.max_requeue,
            requeue_delay: Duration::from_secs(1),
        },
        updates_tx.clone(),
        stop_rx.clone(),
    ));
    let reconciler = tokio::spawn(run_reconciler(
        Reconciler {
            runs: store.runs(),
            records: store.records(),
            cfg: cfg.clone(),
            updates: updates_tx.clone(),
        },
        reconcile_rx,
        stop_rx.clone(),
    ));

    let _ = inner.event_tx.send(RunEvent::Started);
    info!(data_root = %cfg.data_root.display(), "control plane started");

    // Snapshot refresh until a stop is requested.
    loop {
        push_snapshot(&inner, &store, &snapshot_tx).await;
        if inner.should_stop() {
            break;
        }
        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    info!("control plane stopping");

    // Producers first: no new fires, no new dispatches.
    let _ = stop_tx.send(true);
    join_unit("scheduler", scheduler, &inner).await;
    join_unit("dispatcher", dispatcher, &inner).await;

    // The supervisor cancels live runs and waits out their grace periods.
    join_unit("worker supervisor", supervisor, &inner).await;

    // Reconciler drains the finalization queue, then its channel closes.
    drop(reconcile_tx);
    join_unit("reconciliation engine", reconciler, &inner).await;

    // Broadcaster ends once every update producer is gone.
    drop(updates_tx);
    if let Err(err) = broadcaster.await {
        warn!(error = %err, "broadcaster join failed");
    }

    push_snapshot(&inner, &store, &snapshot_tx).await;
    let _ = inner.event_tx.send(RunEvent::Stopped);
    info!("control plane stopped");
    Ok(())
}

async fn join_unit(
    name: &str,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    inner: &EngineInner,
) {
    let failure = match handle.await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{name} exited with error: {err:#}")),
        Err(err) => Some(format!("{name} join error: {err}")),
    };
    if let Some(message) = failure {
        error!("{message}");
        let _ = inner.event_tx.send(RunEvent::Error { message });
    }
}

async fn push_snapshot(inner: &EngineInner, store: &Store, snapshot_tx: &watch::Sender<StatusSnapshot>) {
    let active_runs = match store.runs().list_active().await {
        Ok(runs) => runs
            .into_iter()
            .map(|run| ActiveRunSnapshot {
                run_id: run.id,
                spider_name: run.spider_name,
                project_id: run.project_id,
                state: run.state,
                items_count: run.items_count,
                requests_count: run.requests_count,
                error_count: run.error_count,
                started_at_ms: run.started_at.map(|t| t.timestamp_millis()),
                pid: run.pid,
            })
            .collect(),
        Err(err) => {
            warn!(error = %err, "snapshot refresh failed");
            inner.snapshot_rx.borrow().active_runs.clone()
        }
    };
    let _ = snapshot_tx.send(StatusSnapshot {
        stop_requested: inner.should_stop(),
        active_runs,
        queued_dispatches: inner.queue.len(),
    });
}
