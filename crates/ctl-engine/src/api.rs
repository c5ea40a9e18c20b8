//! Public API types for the in-process control plane.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crawlctl_core::{ControlConfig, RunSettings, RunState, Store, StoreError};

use crate::queue::{DispatchQueue as _, InMemoryQueue};
use crate::supervisor::SupervisorCommand;

/// Why a run is being stopped before its subprocess exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// A caller asked for cancellation; the run ends `CANCELLED`.
    Manual,
    /// The platform is shutting down; the run ends `CANCELLED`.
    Shutdown,
    /// The wall-clock limit was breached; the run ends `FAILED`.
    WallClockExceeded,
    /// The RSS ceiling was breached; the run ends `FAILED`.
    MemoryExceeded,
}

impl StopReason {
    pub(crate) fn terminal_state(self) -> RunState {
        match self {
            StopReason::Manual | StopReason::Shutdown => RunState::Cancelled,
            StopReason::WallClockExceeded | StopReason::MemoryExceeded => RunState::Failed,
        }
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            StopReason::Manual => "cancelled by caller",
            StopReason::Shutdown => "platform shutdown",
            StopReason::WallClockExceeded => "WallClockExceeded",
            StopReason::MemoryExceeded => "MemoryExceeded",
        }
    }
}

/// Errors surfaced by [`EngineHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("control plane is shutting down")]
    ShuttingDown,
}

/// Control-plane event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RunEvent {
    /// Control plane started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// A run's subprocess was spawned.
    RunStarted {
        run_id: String,
        spider: String,
        project_id: String,
        pid: u32,
    },
    /// Rate-limited counter delta for a running run.
    RunProgress {
        run_id: String,
        items_count: i64,
        requests_count: i64,
        error_count: i64,
    },
    /// A run changed lifecycle state.
    RunStateChanged {
        run_id: String,
        state: RunState,
        error_message: Option<String>,
    },
    /// A run reached a terminal state.
    RunFinished {
        run_id: String,
        state: RunState,
        items_count: i64,
        duration_ms: u64,
    },
    /// Ingest fell back to backup spill files for this run.
    IngestDegraded { run_id: String },
    /// The subprocess produced no output file within the wait window.
    OutputMissing { run_id: String },
    /// The output file disappeared while the run was live.
    OutputVanished { run_id: String },
    /// A schedule fired and a dispatch request was enqueued.
    ScheduleFired {
        schedule_id: String,
        spider_id: String,
        fired_at_ms: i64,
    },
    /// A warning from the control plane.
    Warning { message: String },
    /// A non-fatal error from the control plane.
    Error { message: String },
    /// Control plane stopped.
    Stopped,
}

/// Snapshot of one non-terminal run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveRunSnapshot {
    pub run_id: String,
    pub spider_name: String,
    pub project_id: String,
    pub state: RunState,
    pub items_count: i64,
    pub requests_count: i64,
    pub error_count: i64,
    pub started_at_ms: Option<i64>,
    pub pid: Option<u32>,
}

/// Current control-plane snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub stop_requested: bool,
    pub active_runs: Vec<ActiveRunSnapshot>,
    pub queued_dispatches: usize,
}

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<RunEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) queue: Arc<InMemoryQueue>,
    pub(crate) supervisor_tx: mpsc::Sender<SupervisorCommand>,
    pub(crate) runs: crawlctl_core::RunStore,
    stop_requested: AtomicBool,
    pub(crate) notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn new(
        event_tx: broadcast::Sender<RunEvent>,
        snapshot_rx: watch::Receiver<StatusSnapshot>,
        queue: Arc<InMemoryQueue>,
        supervisor_tx: mpsc::Sender<SupervisorCommand>,
        runs: crawlctl_core::RunStore,
    ) -> Self {
        Self {
            event_tx,
            snapshot_rx,
            queue,
            supervisor_tx,
            runs,
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(RunEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Handle to a running control-plane instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start the control plane over an opened store.
pub fn start_control_plane(store: Store, config: ControlConfig) -> EngineHandle {
    crate::engine::start(store, config)
}

impl EngineHandle {
    /// Subscribe to the control-plane event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Latest status snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Manual dispatch: enqueue a run request for a spider, bypassing the
    /// scheduler. Returns the dispatch request id.
    pub async fn dispatch(
        &self,
        spider_id: &str,
        overrides: RunSettings,
    ) -> Result<String, EngineError> {
        if self.inner.should_stop() {
            return Err(EngineError::ShuttingDown);
        }
        let spider = self.inner.runs.get_spider(spider_id).await?;
        let request =
            crawlctl_core::DispatchRequest::manual(spider_id, &spider.project_id, overrides);
        let id = request.id.clone();
        self.inner.queue.enqueue(request).await;
        Ok(id)
    }

    /// Cancel a live run. Returns `false` when the run is not active.
    pub async fn stop_run(&self, run_id: &str) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .supervisor_tx
            .send(SupervisorCommand::StopRun {
                run_id: run_id.to_string(),
                reason: StopReason::Manual,
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Request a graceful shutdown: stop scheduling, cancel live runs, flush
    /// ingest, reconcile what remains.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the control plane to stop.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("control plane task join error: {err}")),
        }
    }
}
