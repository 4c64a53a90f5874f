use crate::crds::AppliedManifestWork;
use crate::crds::ManifestWork;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod apply;
pub mod config;
pub mod finalize;
pub mod naming;
pub mod queue;
pub mod resources;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used items
pub use apply::ApplyController;
pub use config::AgentConfig;
pub use finalize::FinalizeController;
pub use queue::{ExponentialBackoff, QueueSnapshot, WorkQueue};
pub use types::{Context, Error, Result};

use apply::{KubeManifestApplier, KubeWorkSource, WorkSource};
use resources::{KubeResourceClient, ResourceClient};
use store::{KubeRecordStore, RecordStore};
use worker::run_workers;

/// The two key queues driven by the agent, shared with the metrics endpoint
#[derive(Clone)]
pub struct AgentQueues {
    /// Record names awaiting finalization
    pub finalize: WorkQueue<String>,
    /// Work names awaiting apply
    pub apply: WorkQueue<String>,
}

impl AgentQueues {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.queue.base_delay(), config.queue.max_delay());
        Self {
            finalize: WorkQueue::new("appliedmanifestwork-finalizer", backoff),
            apply: WorkQueue::new("manifestwork-apply", backoff),
        }
    }

    pub async fn snapshots(&self) -> Vec<QueueSnapshot> {
        vec![self.finalize.snapshot().await, self.apply.snapshot().await]
    }
}

/// Route one observed record to the queue that cares about it.
/// Records of other hubs are ignored.
pub async fn enqueue_record(queues: &AgentQueues, hub_hash: &str, record: &AppliedManifestWork) {
    if record.spec.hub_hash != hub_hash {
        return;
    }
    if record.is_deleting() {
        queues.finalize.add(record.name_any()).await;
    } else {
        queues.apply.add(record.spec.manifest_work_name.clone()).await;
    }
}

/// Enqueue every known record and work.
///
/// Catches events missed by the watches, including works deleted from the
/// hub while the agent was down: their records still name them, and the
/// apply pass then finds no work and deletes the record.
pub async fn resync(
    store: &dyn RecordStore,
    works: &dyn WorkSource,
    hub_hash: &str,
    queues: &AgentQueues,
) {
    match store.list().await {
        Ok(records) => {
            let mut count = 0;
            for record in &records {
                if record.spec.hub_hash == hub_hash {
                    enqueue_record(queues, hub_hash, record).await;
                    count += 1;
                }
            }
            debug!(records = count, "Resync enqueued records");
        }
        Err(e) => warn!(error = %e, "Resync failed to list applied manifest works"),
    }

    match works.list().await {
        Ok(items) => {
            for work in &items {
                queues.apply.add(work.name_any()).await;
            }
            debug!(works = items.len(), "Resync enqueued works");
        }
        Err(e) => warn!(error = %e, "Resync failed to list manifest works"),
    }
}

/// Main entry point for the work agent
#[instrument(skip_all, fields(cluster = %context.config.agent.cluster_name))]
pub async fn run_work_agent(
    spoke: Client,
    hub: Client,
    context: Context,
    queues: AgentQueues,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = context.config.clone();
    let timeout = config.request_timeout();
    info!(hub_hash = %context.hub_hash, "Starting work agent");

    let store: Arc<dyn RecordStore> = Arc::new(KubeRecordStore::new(spoke.clone(), timeout));
    let resources: Arc<dyn ResourceClient> =
        Arc::new(KubeResourceClient::new(spoke.clone(), timeout));
    let source = Arc::new(KubeWorkSource::new(
        hub,
        &config.agent.cluster_name,
        timeout,
    ));
    let works_api = source.api();
    let works: Arc<dyn WorkSource> = source;

    let finalize = Arc::new(FinalizeController::new(
        store.clone(),
        resources.clone(),
        context.hub_hash.clone(),
        config.conflict_retries,
    ));
    let apply = Arc::new(ApplyController::new(
        works.clone(),
        store.clone(),
        resources,
        Arc::new(KubeManifestApplier::new(spoke.clone(), timeout)),
        context.hub_hash.clone(),
        config.conflict_retries,
    ));

    let handles = vec![
        tokio::spawn(
            watch_records(
                Api::all(spoke),
                context.hub_hash.clone(),
                queues.clone(),
                shutdown.clone(),
            )
            .instrument(tracing::info_span!("record_watch")),
        ),
        tokio::spawn(
            watch_works(works_api, queues.apply.clone(), shutdown.clone())
                .instrument(tracing::info_span!("work_watch")),
        ),
        tokio::spawn(resync_loop(
            store,
            works,
            context.hub_hash.clone(),
            queues.clone(),
            config.resync_interval(),
            shutdown.clone(),
        )),
        tokio::spawn(run_workers(
            queues.finalize.clone(),
            finalize,
            config.workers.finalize,
            shutdown.clone(),
        )),
        tokio::spawn(run_workers(
            queues.apply.clone(),
            apply,
            config.workers.apply,
            shutdown.clone(),
        )),
    ];

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Agent task join error: {:?}", e);
        }
    }

    info!("Work agent shutting down");
    Ok(())
}

async fn watch_records(
    api: Api<AppliedManifestWork>,
    hub_hash: String,
    queues: AgentQueues,
    shutdown: CancellationToken,
) {
    info!("Watching applied manifest works");
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .boxed();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(record)) => enqueue_record(&queues, &hub_hash, &record).await,
                Some(Err(e)) => warn!(error = %e, "Applied manifest work watch error"),
                None => break,
            },
        }
    }
}

async fn watch_works(api: Api<ManifestWork>, queue: WorkQueue<String>, shutdown: CancellationToken) {
    info!("Watching manifest works on the hub");
    // deletions included: a vanished work deletes its record
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .boxed();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(work)) => queue.add(work.name_any()).await,
                Some(Err(e)) => warn!(error = %e, "Manifest work watch error"),
                None => break,
            },
        }
    }
}

async fn resync_loop(
    store: Arc<dyn RecordStore>,
    works: Arc<dyn WorkSource>,
    hub_hash: String,
    queues: AgentQueues,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // the watches deliver the initial listing
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                info!("🔄 Periodic resync");
                resync(store.as_ref(), works.as_ref(), &hub_hash, &queues).await;
            }
        }
    }
}
