//! # Deduplicating Work Queue
//!
//! Keys (record or work names) are queued at most once. A key that is being
//! processed is never handed to a second worker: re-adding it while in flight
//! parks it until [`WorkQueue::done`] is called, at which point it is queued
//! again. Failing keys are re-added after a per-key exponential backoff.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay for a key that has already failed `failures` times.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
}

/// Point-in-time view of a queue, served on the metrics endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub name: String,
    pub depth: usize,
    pub processing: usize,
    /// Consecutive failures per key, only keys currently backing off
    pub retries: BTreeMap<String, u32>,
}

#[derive(Clone)]
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(name: &str, backoff: ExponentialBackoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue `key` now. No-op if it is already pending or the queue is shut down.
    pub async fn add(&self, key: K) {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // picked up again by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed. Pending timers are dropped on shutdown.
    pub async fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }

        let queue = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(key).await,
                () = shutdown.cancelled() => {}
            }
        });
    }

    /// Queue `key` after its backoff delay and bump its failure count.
    /// Returns the delay used.
    pub async fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.shared.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.shared.backoff.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay).await;
        delay
    }

    /// Reset the backoff of `key` after a successful pass.
    pub async fn forget(&self, key: &K) {
        self.shared.state.lock().await.failures.remove(key);
    }

    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.shared
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer in flight, requeueing it if it was re-added meanwhile.
    pub async fn done(&self, key: &K) {
        let mut state = self.shared.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stop handing out keys. In-flight keys may still call `done`.
    pub async fn shut_down(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
        info!(queue = %self.shared.name, "Work queue shut down");
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().await.shutting_down
    }

    /// Number of keys waiting to be handed out
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + Display + 'static,
{
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.state.lock().await;
        let snapshot = QueueSnapshot {
            name: self.shared.name.clone(),
            depth: state.queue.len(),
            processing: state.processing.len(),
            retries: state
                .failures
                .iter()
                .map(|(key, count)| (key.to_string(), *count))
                .collect(),
        };
        debug!(queue = %snapshot.name, depth = snapshot.depth, "Queue snapshot taken");
        snapshot
    }
}
