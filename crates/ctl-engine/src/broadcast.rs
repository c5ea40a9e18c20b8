//! Rate-limited fan-out of per-run progress to event subscribers.
//!
//! Components push [`Update`]s over an mpsc channel; the broadcaster maps
//! them to public [`RunEvent`]s, throttling counter deltas to one per run per
//! broadcast interval while always forwarding state transitions immediately.
//! Delivery is best-effort: lagging subscribers miss intermediate updates and
//! re-sync from the run store.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crawlctl_core::RunState;

use crate::api::RunEvent;

/// Internal progress bus payload.
#[derive(Debug, Clone)]
pub(crate) enum Update {
    Started {
        run_id: String,
        spider: String,
        project_id: String,
        pid: u32,
    },
    /// Running counter totals as seen by the ingest pipeline.
    Counters {
        run_id: String,
        items: i64,
        requests: i64,
        errors: i64,
    },
    State {
        run_id: String,
        state: RunState,
        error_message: Option<String>,
    },
    Finished {
        run_id: String,
        state: RunState,
        items: i64,
        duration_ms: u64,
    },
    Degraded { run_id: String },
    OutputMissing { run_id: String },
    OutputVanished { run_id: String },
    ScheduleFired {
        schedule_id: String,
        spider_id: String,
        fired_at_ms: i64,
    },
    Warning(String),
}

struct RunThrottle {
    /// `None` until the first delta goes out, which is never throttled.
    last_emit: Option<Instant>,
    pending: Option<RunEvent>,
}

impl RunThrottle {
    fn due(&self, now: Instant, interval: Duration) -> bool {
        self.last_emit
            .is_none_or(|at| now.duration_since(at) >= interval)
    }
}

/// Runs until the update channel closes (all producers dropped).
pub(crate) async fn run_broadcaster(
    mut rx: mpsc::Receiver<Update>,
    events: broadcast::Sender<RunEvent>,
    interval: Duration,
) {
    let mut per_run: HashMap<String, RunThrottle> = HashMap::new();
    let tick_period = interval
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(100));
    let mut tick = tokio::time::interval(tick_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                handle(update, &mut per_run, &events, interval);
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for throttle in per_run.values_mut() {
                    if throttle.pending.is_some() && throttle.due(now, interval) {
                        if let Some(event) = throttle.pending.take() {
                            let _ = events.send(event);
                            throttle.last_emit = Some(now);
                        }
                    }
                }
            }
        }
    }

    // Drain anything still pending so terminal progress is not lost.
    for (_, throttle) in per_run {
        if let Some(event) = throttle.pending {
            let _ = events.send(event);
        }
    }
}

fn handle(
    update: Update,
    per_run: &mut HashMap<String, RunThrottle>,
    events: &broadcast::Sender<RunEvent>,
    interval: Duration,
) {
    match update {
        Update::Counters { run_id, items, requests, errors } => {
            let event = RunEvent::RunProgress {
                run_id: run_id.clone(),
                items_count: items,
                requests_count: requests,
                error_count: errors,
            };
            let now = Instant::now();
            let throttle = per_run.entry(run_id).or_insert_with(|| RunThrottle {
                last_emit: None,
                pending: None,
            });
            if throttle.due(now, interval) {
                let _ = events.send(event);
                throttle.last_emit = Some(now);
                throttle.pending = None;
            } else {
                throttle.pending = Some(event);
            }
        }
        Update::Started { run_id, spider, project_id, pid } => {
            let _ = events.send(RunEvent::RunStarted {
                run_id,
                spider,
                project_id,
                pid,
            });
        }
        Update::State { run_id, state, error_message } => {
            flush_pending(per_run, &run_id, events);
            let _ = events.send(RunEvent::RunStateChanged {
                run_id,
                state,
                error_message,
            });
        }
        Update::Finished { run_id, state, items, duration_ms } => {
            flush_pending(per_run, &run_id, events);
            per_run.remove(&run_id);
            let _ = events.send(RunEvent::RunFinished {
                run_id,
                state,
                items_count: items,
                duration_ms,
            });
        }
        Update::Degraded { run_id } => {
            let _ = events.send(RunEvent::IngestDegraded { run_id });
        }
        Update::OutputMissing { run_id } => {
            let _ = events.send(RunEvent::OutputMissing { run_id });
        }
        Update::OutputVanished { run_id } => {
            let _ = events.send(RunEvent::OutputVanished { run_id });
        }
        Update::ScheduleFired { schedule_id, spider_id, fired_at_ms } => {
            let _ = events.send(RunEvent::ScheduleFired {
                schedule_id,
                spider_id,
                fired_at_ms,
            });
        }
        Update::Warning(message) => {
            let _ = events.send(RunEvent::Warning { message });
        }
    }
}

fn flush_pending(
    per_run: &mut HashMap<String, RunThrottle>,
    run_id: &str,
    events: &broadcast::Sender<RunEvent>,
) {
    if let Some(throttle) = per_run.get_mut(run_id) {
        if let Some(event) = throttle.pending.take() {
            let _ = events.send(event);
            throttle.last_emit = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(run: &str, items: i64) -> Update {
        Update::Counters {
            run_id: run.to_string(),
            items,
            requests: 0,
            errors: 0,
        }
    }

    async fn collect(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn counter_deltas_are_throttled_but_transitions_pass_through() {
        let (tx, rx_updates) = mpsc::channel(64);
        let (events, mut rx) = broadcast::channel(64);
        let task = tokio::spawn(run_broadcaster(
            rx_updates,
            events,
            Duration::from_secs(30),
        ));

        tx.send(counters("r1", 1)).await.unwrap();
        tx.send(counters("r1", 2)).await.unwrap();
        tx.send(counters("r1", 3)).await.unwrap();
        tx.send(Update::State {
            run_id: "r1".to_string(),
            state: RunState::Finished,
            error_message: None,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let got = collect(&mut rx).await;
        // First delta immediately, then the latest pending one is flushed by
        // the state change, then the transition itself.
        assert_eq!(
            got,
            vec![
                RunEvent::RunProgress {
                    run_id: "r1".to_string(),
                    items_count: 1,
                    requests_count: 0,
                    error_count: 0,
                },
                RunEvent::RunProgress {
                    run_id: "r1".to_string(),
                    items_count: 3,
                    requests_count: 0,
                    error_count: 0,
                },
                RunEvent::RunStateChanged {
                    run_id: "r1".to_string(),
                    state: RunState::Finished,
                    error_message: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn runs_are_throttled_independently() {
        let (tx, rx_updates) = mpsc::channel(64);
        let (events, mut rx) = broadcast::channel(64);
        let task = tokio::spawn(run_broadcaster(
            rx_updates,
            events,
            Duration::from_secs(30),
        ));

        tx.send(counters("r1", 1)).await.unwrap();
        tx.send(counters("r2", 5)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let got = collect(&mut rx).await;
        assert_eq!(got.len(), 2);
    }
}
