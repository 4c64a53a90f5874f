use super::resolve::resolve_applied_resources;
use crate::crds::AppliedManifestWork;
use crate::tasks::resources::ResourceClient;
use crate::tasks::store::{update_record, update_record_status, RecordStore};
use crate::tasks::types::{Error, Result, APPLIED_MANIFEST_WORK_FINALIZER};
use crate::tasks::worker::{Outcome, Reconciler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Releases the cleanup finalizer of deleting `AppliedManifestWork` records
/// once every resource they recorded has been resolved.
pub struct FinalizeController {
    store: Arc<dyn RecordStore>,
    resources: Arc<dyn ResourceClient>,
    hub_hash: String,
    conflict_retries: u32,
}

impl FinalizeController {
    pub fn new(
        store: Arc<dyn RecordStore>,
        resources: Arc<dyn ResourceClient>,
        hub_hash: impl Into<String>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            resources,
            hub_hash: hub_hash.into(),
            conflict_retries,
        }
    }

    /// One finalization pass over a record read at the start of the pass.
    ///
    /// Nothing is written while any entry is pending. Once all entries are
    /// resolved the tracked list is cleared first and the finalizer removed
    /// second, each against a fresh read.
    #[instrument(skip(self, record), fields(record = %record.name_any()))]
    pub async fn sync_applied_manifest_work(&self, record: AppliedManifestWork) -> Result<Outcome> {
        let name = record.name_any();

        if record.spec.hub_hash != self.hub_hash {
            debug!("Record belongs to another hub, skipping");
            return Ok(Outcome::Done);
        }
        if !record.is_deleting() {
            return Ok(Outcome::Done);
        }
        if !record.has_finalizer(APPLIED_MANIFEST_WORK_FINALIZER) {
            debug!("Cleanup finalizer already released");
            return Ok(Outcome::Done);
        }

        info!(
            work = %record.spec.manifest_work_name,
            entries = record.applied_resources().len(),
            "🧹 Finalizing applied manifest work"
        );

        let reason = format!(
            "manifestwork {} is terminating",
            record.spec.manifest_work_name
        );
        let resolution =
            resolve_applied_resources(self.resources.as_ref(), record.applied_resources(), &reason)
                .await;

        if !resolution.is_settled() {
            info!(
                pending = resolution.pending.len(),
                failed = resolution.errors.len(),
                "⏳ Resources still pending, waiting"
            );
            Error::aggregate(resolution.errors)?;
            return Ok(Outcome::Requeue);
        }

        let resolved = resolution.resolved;
        let Some(updated) = update_record_status(
            self.store.as_ref(),
            &name,
            self.conflict_retries,
            |fresh| {
                let before = fresh.applied_resources().len();
                let remaining: Vec<_> = fresh
                    .applied_resources()
                    .iter()
                    .filter(|entry| !resolved.contains(entry))
                    .cloned()
                    .collect();
                if remaining.len() == before {
                    return false;
                }
                fresh.set_applied_resources(remaining);
                true
            },
        )
        .await?
        else {
            return Ok(Outcome::Done);
        };

        if !updated.applied_resources().is_empty() {
            // entries recorded after this pass started
            info!(
                entries = updated.applied_resources().len(),
                "New resources recorded during finalization, requeueing"
            );
            return Ok(Outcome::Requeue);
        }

        let released = update_record(
            self.store.as_ref(),
            &name,
            self.conflict_retries,
            |fresh| {
                fresh.applied_resources().is_empty()
                    && fresh.remove_finalizer(APPLIED_MANIFEST_WORK_FINALIZER)
            },
        )
        .await?;

        if let Some(fresh) = released {
            if fresh.has_finalizer(APPLIED_MANIFEST_WORK_FINALIZER) {
                info!("Record changed before finalizer removal, requeueing");
                return Ok(Outcome::Requeue);
            }
        }

        info!("✅ Cleanup finalizer removed");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Reconciler for FinalizeController {
    async fn reconcile(&self, key: &str) -> Result<Outcome> {
        match self.store.get(key).await? {
            Some(record) => self.sync_applied_manifest_work(record).await,
            None => {
                debug!(record = %key, "Record no longer exists");
                Ok(Outcome::Done)
            }
        }
    }
}
