//! Worker supervisor: exclusive owner of crawl subprocesses and of the
//! active-run map. Everyone else (dispatcher, engine handle) talks to it
//! over the command channel; nothing reads the map directly.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crawlctl_core::store::TransitionFields;
use crawlctl_core::{ControlConfig, RecordStore, RunOrigin, RunSettings, RunState, RunStore, StoreError};

use crate::api::StopReason;
use crate::broadcast::Update;
use crate::proc::{process_alive, signal_process_group};
use crate::worker::{RunContext, run_worker};

pub(crate) enum SupervisorCommand {
    StartRun {
        spider_id: String,
        overrides: RunSettings,
        origin: RunOrigin,
        reply: oneshot::Sender<Result<String, StoreError>>,
    },
    StopRun {
        run_id: String,
        reason: StopReason,
        reply: oneshot::Sender<bool>,
    },
    ActiveCounts {
        reply: oneshot::Sender<ActiveCounts>,
    },
}

/// Live-run counts per capacity scope, for the dispatcher's ceilings.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveCounts {
    pub total: usize,
    pub per_spider: HashMap<String, usize>,
    pub per_project: HashMap<String, usize>,
}

#[derive(Clone)]
pub(crate) struct SupervisorHandle {
    pub tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub(crate) async fn start_run(
        &self,
        spider_id: &str,
        overrides: RunSettings,
        origin: RunOrigin,
    ) -> Option<Result<String, StoreError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::StartRun {
                spider_id: spider_id.to_string(),
                overrides,
                origin,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// `None` once the supervisor is gone (engine shutdown).
    pub(crate) async fn active_counts(&self) -> Option<ActiveCounts> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::ActiveCounts { reply })
            .await
            .ok()?;
        rx.await.ok()
    }
}

struct ActiveRun {
    spider_id: String,
    project_id: String,
    cancel: watch::Sender<Option<StopReason>>,
}

pub(crate) struct Supervisor {
    runs: RunStore,
    records: RecordStore,
    cfg: ControlConfig,
    updates: mpsc::Sender<Update>,
    reconcile: mpsc::Sender<String>,
    active: HashMap<String, ActiveRun>,
    workers: JoinSet<String>,
}

impl Supervisor {
    pub(crate) fn new(
        runs: RunStore,
        records: RecordStore,
        cfg: ControlConfig,
        updates: mpsc::Sender<Update>,
        reconcile: mpsc::Sender<String>,
    ) -> Self {
        Self {
            runs,
            records,
            cfg,
            updates,
            reconcile,
            active: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<SupervisorCommand>,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.sweep_orphans().await;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(res) = self.workers.join_next(), if !self.workers.is_empty() => {
                    self.reap(res);
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        // Graceful shutdown: cancel everything, then wait for the per-run
        // grace/kill logic to finish each worker.
        for run in self.active.values() {
            let _ = run.cancel.send(Some(StopReason::Shutdown));
        }
        while let Some(res) = self.workers.join_next().await {
            self.reap(res);
        }
        Ok(())
    }

    fn reap(&mut self, res: Result<String, tokio::task::JoinError>) {
        match res {
            Ok(run_id) => {
                self.active.remove(&run_id);
            }
            Err(err) => warn!(error = %err, "run worker task panicked or was aborted"),
        }
    }

    async fn handle(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::StartRun { spider_id, overrides, origin, reply } => {
                let _ = reply.send(self.start_run(&spider_id, overrides, origin).await);
            }
            SupervisorCommand::StopRun { run_id, reason, reply } => {
                let hit = match self.active.get(&run_id) {
                    Some(run) => run.cancel.send(Some(reason)).is_ok(),
                    None => false,
                };
                let _ = reply.send(hit);
            }
            SupervisorCommand::ActiveCounts { reply } => {
                let mut counts = ActiveCounts {
                    total: self.active.len(),
                    ..Default::default()
                };
                for run in self.active.values() {
                    *counts.per_spider.entry(run.spider_id.clone()).or_default() += 1;
                    *counts.per_project.entry(run.project_id.clone()).or_default() += 1;
                }
                let _ = reply.send(counts);
            }
        }
    }

    async fn start_run(
        &mut self,
        spider_id: &str,
        overrides: RunSettings,
        origin: RunOrigin,
    ) -> Result<String, StoreError> {
        let run = self
            .runs
            .create_run(spider_id, &overrides, origin, &self.cfg.runs_root())
            .await?;
        let project = match self.runs.get_project(&run.project_id).await {
            Ok(project) => project,
            Err(err) => {
                // Don't leave the fresh row stuck in PENDING.
                let _ = self
                    .runs
                    .transition(
                        &run.id,
                        RunState::Pending,
                        RunState::Failed,
                        TransitionFields {
                            finished_at: Some(chrono::Utc::now()),
                            error_message: Some(format!("SpawnFailure: project lookup: {err}")),
                            ..Default::default()
                        },
                    )
                    .await;
                return Err(err);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(None);
        self.active.insert(
            run.id.clone(),
            ActiveRun {
                spider_id: run.spider_id.clone(),
                project_id: run.project_id.clone(),
                cancel: cancel_tx,
            },
        );

        let run_id = run.id.clone();
        self.workers.spawn(run_worker(RunContext {
            run,
            project,
            cfg: self.cfg.clone(),
            runs: self.runs.clone(),
            records: self.records.clone(),
            updates: self.updates.clone(),
            reconcile: self.reconcile.clone(),
            cancel: cancel_rx,
        }));
        Ok(run_id)
    }

    /// Startup repair: `RUNNING` rows left behind by a previous platform
    /// instance have no owning worker anymore. Kill any stray process group
    /// and fail the run; reconciliation then trues up its counters from the
    /// output file.
    async fn sweep_orphans(&self) {
        let orphans = match self.runs.running_runs().await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "orphan sweep: listing RUNNING runs failed");
                return;
            }
        };
        for run in orphans {
            if let Some(pid) = run.pid {
                if process_alive(pid) {
                    signal_process_group(pid, libc::SIGTERM);
                }
            }
            match self
                .runs
                .mark_interrupted(&run.id, "Interrupted: control plane restarted")
                .await
            {
                Ok(true) => {
                    info!(run_id = %run.id, "orphaned run marked interrupted");
                    let _ = self.reconcile.send(run.id.clone()).await;
                }
                Ok(false) => {}
                Err(err) => warn!(run_id = %run.id, error = %err, "orphan repair failed"),
            }
        }
    }
}
