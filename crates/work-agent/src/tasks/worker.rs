use crate::tasks::queue::WorkQueue;
use crate::tasks::types::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// What the worker should do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Key fully handled; its backoff is reset
    Done,
    /// State not settled yet; key is re-added after its backoff delay
    Requeue,
}

/// One reconciliation pass for a queue key
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &str) -> Result<Outcome>;
}

/// Pull one key, reconcile it and acknowledge it.
/// Returns false once the queue has been shut down.
pub async fn process_next_item(queue: &WorkQueue<String>, reconciler: &dyn Reconciler) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match reconciler.reconcile(&key).await {
        Ok(Outcome::Done) => {
            queue.forget(&key).await;
        }
        Ok(Outcome::Requeue) => {
            let delay = queue.add_rate_limited(key.clone()).await;
            debug!(queue = %queue.name(), key = %key, ?delay, "Requeued key");
        }
        Err(err) => {
            let delay = queue.add_rate_limited(key.clone()).await;
            let retries = queue.num_requeues(&key).await;
            if err.is_retryable() {
                warn!(queue = %queue.name(), key = %key, retries, ?delay, error = %err, "Reconcile failed, retrying");
            } else {
                // still requeued: a fixed manifest or config must be picked up
                error!(queue = %queue.name(), key = %key, retries, ?delay, error = %err, "Reconcile failed with a non-retryable error");
            }
        }
    }

    queue.done(&key).await;
    true
}

/// Run `workers` loops over `queue` until `shutdown` fires.
/// An in-flight pass always completes before its worker exits.
pub async fn run_workers(
    queue: WorkQueue<String>,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    shutdown: CancellationToken,
) {
    info!(queue = %queue.name(), workers, "Starting workers");

    let stopper = {
        let queue = queue.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            queue.shut_down().await;
        })
    };

    let handles: Vec<_> = (0..workers)
        .map(|id| {
            let queue = queue.clone();
            let reconciler = reconciler.clone();
            let span = tracing::info_span!("worker", queue = %queue.name(), id);
            tokio::spawn(
                async move { while process_next_item(&queue, reconciler.as_ref()).await {} }
                    .instrument(span),
            )
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(queue = %queue.name(), "Worker task join error: {:?}", e);
        }
    }
    stopper.abort();

    info!(queue = %queue.name(), "Workers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::queue::ExponentialBackoff;
    use crate::tasks::types::Error;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct ScriptedReconciler {
        outcomes: Mutex<HashMap<String, Vec<Result<Outcome>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedReconciler {
        fn new(key: &str, outcomes: Vec<Result<Outcome>>) -> Self {
            let mut map = HashMap::new();
            map.insert(key.to_string(), outcomes);
            Self {
                outcomes: Mutex::new(map),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Reconciler for ScriptedReconciler {
        async fn reconcile(&self, key: &str) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().await;
            match outcomes.get_mut(key) {
                Some(list) if !list.is_empty() => list.remove(0),
                _ => Ok(Outcome::Done),
            }
        }
    }

    fn immediate_queue() -> WorkQueue<String> {
        WorkQueue::new(
            "test",
            ExponentialBackoff::new(Duration::ZERO, Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn requeue_outcome_readds_key_and_counts_retry() {
        let queue = immediate_queue();
        let reconciler = ScriptedReconciler::new("a", vec![Ok(Outcome::Requeue)]);
        queue.add("a".to_string()).await;

        assert!(process_next_item(&queue, &reconciler).await);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.num_requeues(&"a".to_string()).await, 1);

        assert!(process_next_item(&queue, &reconciler).await);
        assert!(queue.is_empty().await);
        assert_eq!(queue.num_requeues(&"a".to_string()).await, 0);
    }

    #[tokio::test]
    async fn errors_are_requeued_not_dropped() {
        let queue = immediate_queue();
        let reconciler = ScriptedReconciler::new(
            "a",
            vec![
                Err(Error::Timeout("get".to_string())),
                Err(Error::InvalidManifest("bad".to_string())),
            ],
        );
        queue.add("a".to_string()).await;

        assert!(process_next_item(&queue, &reconciler).await);
        assert!(process_next_item(&queue, &reconciler).await);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.num_requeues(&"a".to_string()).await, 2);
    }

    #[tokio::test]
    async fn workers_exit_on_shutdown() {
        let queue = immediate_queue();
        let reconciler = Arc::new(ScriptedReconciler::new("a", vec![]));
        let shutdown = CancellationToken::new();
        queue.add("a".to_string()).await;
        queue.add("b".to_string()).await;

        let runner = tokio::spawn(run_workers(
            queue.clone(),
            reconciler.clone(),
            2,
            shutdown.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.calls.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.is_shutting_down().await);
    }
}
