//! Dispatch queue consumer: enforces global and per-scope concurrency
//! ceilings and asks the worker supervisor to start runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crawlctl_core::DispatchRequest;

use crate::broadcast::Update;
use crate::queue::DispatchQueue;
use crate::supervisor::{ActiveCounts, SupervisorHandle};

#[derive(Debug, Clone)]
pub(crate) struct DispatcherConfig {
    pub max_concurrent_runs: usize,
    pub max_per_spider: usize,
    pub max_per_project: Option<usize>,
    /// Requeue count after which a starved request ages to high priority.
    pub max_requeue: u32,
    pub requeue_delay: Duration,
}

pub(crate) async fn run_dispatcher(
    queue: Arc<dyn DispatchQueue>,
    supervisor: SupervisorHandle,
    cfg: DispatcherConfig,
    updates: mpsc::Sender<Update>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            request = queue.dequeue(Duration::from_millis(500)) => {
                let Some(mut request) = request else { continue };
                let Some(counts) = supervisor.active_counts().await else {
                    // Supervisor gone: the engine is tearing down.
                    break;
                };

                if at_capacity(&counts, &request, &cfg) {
                    request.attempts += 1;
                    if request.attempts >= cfg.max_requeue && !request.high_priority {
                        debug!(request_id = %request.id, "request aged to high priority");
                        request.high_priority = true;
                    }
                    queue.enqueue_delayed(request, cfg.requeue_delay).await;
                    continue;
                }

                match supervisor
                    .start_run(&request.spider_id, request.overrides.clone(), request.origin())
                    .await
                {
                    Some(Ok(run_id)) => {
                        debug!(request_id = %request.id, run_id = %run_id, "dispatched");
                    }
                    Some(Err(err)) => {
                        // NotFound here usually means the spider or project
                        // was deleted between fire and dispatch.
                        warn!(
                            request_id = %request.id,
                            spider_id = %request.spider_id,
                            error = %err,
                            "dispatch rejected"
                        );
                        let _ = updates
                            .send(Update::Warning(format!(
                                "dispatch for spider {} rejected: {err}",
                                request.spider_id
                            )))
                            .await;
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn at_capacity(counts: &ActiveCounts, request: &DispatchRequest, cfg: &DispatcherConfig) -> bool {
    if counts.total >= cfg.max_concurrent_runs {
        return true;
    }
    let spider_active = counts
        .per_spider
        .get(&request.spider_id)
        .copied()
        .unwrap_or(0);
    if spider_active >= cfg.max_per_spider {
        return true;
    }
    if let Some(max_per_project) = cfg.max_per_project {
        let project_active = counts
            .per_project
            .get(&request.project_id)
            .copied()
            .unwrap_or(0);
        if project_active >= max_per_project {
            return true;
        }
    }
    false
}
