//! Dispatch queue abstraction: ordered delivery, single consumer.
//!
//! The in-memory implementation is sufficient for single-node deployments;
//! a broker-backed queue only has to satisfy the same trait.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crawlctl_core::DispatchRequest;

/// FIFO queue of dispatch requests with exactly-once delivery to a single
/// consumer. `enqueue_delayed` supports the dispatcher's put-back-with-delay
/// path; requests flagged high priority jump the line once ready.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, request: DispatchRequest);
    async fn enqueue_delayed(&self, request: DispatchRequest, delay: Duration);
    /// Next ready request, or `None` once `timeout` elapses.
    async fn dequeue(&self, timeout: Duration) -> Option<DispatchRequest>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<DispatchRequest>,
    delayed: Vec<(Instant, DispatchRequest)>,
}

impl QueueState {
    fn push_ready(&mut self, request: DispatchRequest) {
        if request.high_priority {
            self.ready.push_front(request);
        } else {
            self.ready.push_back(request);
        }
    }

    /// Move due delayed entries into the ready line; returns the wake-up
    /// instant of the earliest still-sleeping entry.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, request) = self.delayed.swap_remove(i);
                self.push_ready(request);
            } else {
                i += 1;
            }
        }
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

pub struct InMemoryQueue {
    // Plain data with no cross-field invariant; a poisoned lock is recovered
    // with `into_inner`, never panicked on.
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn enqueue(&self, request: DispatchRequest) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_ready(request);
        self.notify.notify_one();
    }

    async fn enqueue_delayed(&self, request: DispatchRequest, delay: Duration) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delayed
            .push((Instant::now() + delay, request));
        self.notify.notify_one();
    }

    async fn dequeue(&self, timeout: Duration) -> Option<DispatchRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_wake = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let next_delay = state.promote_due(Instant::now());
                if let Some(request) = state.ready.pop_front() {
                    return Some(request);
                }
                next_delay
            };

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {
                    if wake >= deadline {
                        // One last look in case an enqueue raced the timeout.
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.promote_due(Instant::now());
                        return state.ready.pop_front();
                    }
                }
            }
        }
    }

    fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ready.len() + state.delayed.len()
    }
}
