//! Cron evaluation and at-most-once dispatch.
//!
//! Every tick loads due schedules and tries to claim each fire with the
//! store's compare-and-set. Any number of scheduler instances can run
//! concurrently; losers of the CAS simply skip (`ScheduleRace` is silent by
//! design). When fires were missed (downtime), only the latest instant is
//! dispatched; fresh data beats replaying a backlog.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crawlctl_core::cron::CronExpr;
use crawlctl_core::store::DueSchedule;
use crawlctl_core::{DispatchRequest, RunStore};

use crate::broadcast::Update;
use crate::queue::DispatchQueue;

pub(crate) async fn run_scheduler(
    runs: RunStore,
    queue: Arc<dyn DispatchQueue>,
    updates: mpsc::Sender<Update>,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = evaluate_due(&runs, queue.as_ref(), &updates, Utc::now()).await {
                    // Transient store trouble heals on the next tick; the
                    // conditional update makes a half-finished tick safe.
                    warn!(error = %err, "scheduler tick failed");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn evaluate_due(
    runs: &RunStore,
    queue: &dyn DispatchQueue,
    updates: &mpsc::Sender<Update>,
    now: DateTime<Utc>,
) -> Result<(), crawlctl_core::StoreError> {
    for DueSchedule { schedule, project_id } in runs.load_due_schedules(now).await? {
        let Some(first_due) = schedule.next_fire_time else {
            continue;
        };
        let expr = match CronExpr::parse(&schedule.cron) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(schedule_id = %schedule.id, error = %err, "unparsable cron; skipping");
                continue;
            }
        };

        // Fold missed fires into the single most recent instant <= now.
        let mut fired_at = first_due;
        while let Some(next) = expr.next_after(fired_at) {
            if next <= now {
                fired_at = next;
            } else {
                break;
            }
        }
        let new_next = expr.next_after(fired_at);

        match runs
            .advance_schedule(&schedule.id, schedule.last_fire_time, fired_at, new_next)
            .await
        {
            Ok(true) => {
                queue
                    .enqueue(DispatchRequest::scheduled(
                        &schedule.id,
                        &schedule.spider_id,
                        &project_id,
                        fired_at,
                        schedule.overrides.clone(),
                    ))
                    .await;
                let _ = updates
                    .send(Update::ScheduleFired {
                        schedule_id: schedule.id.clone(),
                        spider_id: schedule.spider_id.clone(),
                        fired_at_ms: fired_at.timestamp_millis(),
                    })
                    .await;
                debug!(schedule_id = %schedule.id, %fired_at, "schedule fired");
            }
            Ok(false) => {
                // Another instance claimed this fire.
                debug!(schedule_id = %schedule.id, "lost schedule race");
            }
            Err(err) if err.is_retryable() => {
                warn!(schedule_id = %schedule.id, error = %err, "advance deferred to next tick");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crawlctl_core::{RunSettings, Store};
    use std::path::Path;

    async fn schedule_due_in_the_past(store: &Store) -> (String, String, DateTime<Utc>) {
        let runs = store.runs();
        let project = runs.create_project("shop", Path::new("/srv/shop")).await.unwrap();
        let spider = runs
            .create_spider(&project.id, "listing", &RunSettings::default())
            .await
            .unwrap();
        let schedule = runs
            .create_schedule(&spider.id, "*/10 * * * *", true, &RunSettings::default())
            .await
            .unwrap();
        // Rewind the schedule so it is overdue by several fire periods.
        let past = schedule.next_fire_time.unwrap() - chrono::Duration::hours(2);
        runs.advance_schedule(&schedule.id, None, past, Some(past))
            .await
            .unwrap();
        (schedule.id, spider.id, past)
    }

    #[tokio::test]
    async fn concurrent_evaluations_dispatch_exactly_once() {
        let store = Store::open_in_memory().await.unwrap();
        let (schedule_id, _, _) = schedule_due_in_the_past(&store).await;
        let queue = InMemoryQueue::new();
        let (updates, _rx) = mpsc::channel(16);
        let now = Utc::now();

        let runs = store.runs();
        let (a, b) = tokio::join!(
            evaluate_due(&runs, &queue, &updates, now),
            evaluate_due(&runs, &queue, &updates, now),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(queue.len(), 1);
        let schedule = store.runs().get_schedule(&schedule_id).await.unwrap();
        assert!(schedule.last_fire_time.unwrap() <= now);
        assert!(schedule.next_fire_time.unwrap() > now);
    }

    #[tokio::test]
    async fn missed_fires_fold_into_the_latest_instant() {
        let store = Store::open_in_memory().await.unwrap();
        let (schedule_id, spider_id, rewound_to) = schedule_due_in_the_past(&store).await;
        let queue = InMemoryQueue::new();
        let (updates, _rx) = mpsc::channel(16);
        let now = Utc::now();

        evaluate_due(&store.runs(), &queue, &updates, now).await.unwrap();

        // A dozen missed ten-minute fires collapse into one dispatch carrying
        // the most recent matching instant.
        assert_eq!(queue.len(), 1);
        let req = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(req.spider_id, spider_id);
        assert_eq!(req.schedule_id.as_deref(), Some(schedule_id.as_str()));
        assert!(req.fired_at <= now);
        assert!(now - req.fired_at <= chrono::Duration::minutes(10));
        assert!(req.fired_at > rewound_to);
    }

    #[tokio::test]
    async fn inactive_schedules_never_fire() {
        let store = Store::open_in_memory().await.unwrap();
        let (schedule_id, _, _) = schedule_due_in_the_past(&store).await;
        store
            .runs()
            .set_schedule_active(&schedule_id, false)
            .await
            .unwrap();

        let queue = InMemoryQueue::new();
        let (updates, _rx) = mpsc::channel(16);
        evaluate_due(&store.runs(), &queue, &updates, Utc::now())
            .await
            .unwrap();
        assert!(queue.is_empty());
    }
}
