use super::applier::{owner_reference, ManifestApplier};
use super::source::WorkSource;
use super::tracker::sync_applied_resources;
use crate::crds::{AppliedManifestWork, AppliedManifestWorkSpec, ManifestWork};
use crate::tasks::naming::RecordNaming;
use crate::tasks::resources::ResourceClient;
use crate::tasks::store::{update_record, RecordStore};
use crate::tasks::types::{Error, Result, APPLIED_MANIFEST_WORK_FINALIZER};
use crate::tasks::worker::{Outcome, Reconciler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Applies hub `ManifestWork`s onto the spoke and keeps their
/// `AppliedManifestWork` records current. Keys are work names.
pub struct ApplyController {
    works: Arc<dyn WorkSource>,
    store: Arc<dyn RecordStore>,
    resources: Arc<dyn ResourceClient>,
    applier: Arc<dyn ManifestApplier>,
    hub_hash: String,
    conflict_retries: u32,
}

impl ApplyController {
    pub fn new(
        works: Arc<dyn WorkSource>,
        store: Arc<dyn RecordStore>,
        resources: Arc<dyn ResourceClient>,
        applier: Arc<dyn ManifestApplier>,
        hub_hash: impl Into<String>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            works,
            store,
            resources,
            applier,
            hub_hash: hub_hash.into(),
            conflict_retries,
        }
    }

    /// Record for `work_name`, created with the cleanup finalizer if missing.
    async fn ensure_record(&self, record_name: &str, work_name: &str) -> Result<AppliedManifestWork> {
        match self.store.get(record_name).await? {
            None => {
                let mut record = AppliedManifestWork::new(
                    record_name,
                    AppliedManifestWorkSpec {
                        hub_hash: self.hub_hash.clone(),
                        manifest_work_name: work_name.to_string(),
                    },
                );
                record.add_finalizer(APPLIED_MANIFEST_WORK_FINALIZER);
                info!(record = %record_name, "📝 Creating applied manifest work");
                self.store.create(&record).await
            }
            Some(record) if !record.is_deleting() && !record.has_finalizer(APPLIED_MANIFEST_WORK_FINALIZER) => {
                update_record(self.store.as_ref(), record_name, self.conflict_retries, |fresh| {
                    !fresh.is_deleting() && fresh.add_finalizer(APPLIED_MANIFEST_WORK_FINALIZER)
                })
                .await?
                .ok_or_else(|| Error::Conflict(format!("appliedmanifestwork {record_name} vanished")))
            }
            Some(record) => Ok(record),
        }
    }

    /// Request deletion of the record. Its finalizer keeps it until every
    /// tracked resource is resolved.
    async fn delete_record(&self, record_name: &str) -> Result<Outcome> {
        match self.store.get(record_name).await? {
            None => Ok(Outcome::Done),
            Some(record) if record.is_deleting() => {
                debug!(record = %record_name, "Record already deleting");
                Ok(Outcome::Done)
            }
            Some(_) => {
                if self.store.delete(record_name).await? {
                    info!(record = %record_name, "🗑️ Work removed from hub, deleting applied manifest work");
                }
                Ok(Outcome::Done)
            }
        }
    }

    #[instrument(skip(self, work), fields(work = %work.name_any()))]
    pub async fn sync_manifest_work(&self, work: ManifestWork) -> Result<Outcome> {
        let work_name = work.name_any();
        let record_name = RecordNaming::record_name(&self.hub_hash, &work_name);

        let record = self.ensure_record(&record_name, &work_name).await?;
        if record.is_deleting() {
            // recreated once finalization releases the old record
            info!(record = %record_name, "Previous record still finalizing, requeueing");
            return Ok(Outcome::Requeue);
        }
        let owner = owner_reference(&record)?;

        let manifests = &work.spec.workload.manifests;
        let mut applied = Vec::with_capacity(manifests.len());
        let mut errors = Vec::new();
        for (index, manifest) in manifests.iter().enumerate() {
            match self.applier.apply(manifest, &owner).await {
                Ok(reference) => applied.push(reference),
                Err(err) => {
                    warn!(index, error = %err, "Failed to apply manifest");
                    errors.push(err);
                }
            }
        }
        let apply_complete = errors.is_empty();

        let pending = match sync_applied_resources(
            self.store.as_ref(),
            self.resources.as_ref(),
            &record_name,
            applied,
            apply_complete,
            self.conflict_retries,
        )
        .await
        {
            Ok(pending) => pending,
            Err(err) => {
                errors.push(err);
                false
            }
        };

        Error::aggregate(errors)?;
        if pending {
            return Ok(Outcome::Requeue);
        }

        info!(manifests = manifests.len(), "✅ Manifest work applied");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Reconciler for ApplyController {
    async fn reconcile(&self, key: &str) -> Result<Outcome> {
        match self.works.get(key).await? {
            Some(work) if work.metadata.deletion_timestamp.is_none() => {
                self.sync_manifest_work(work).await
            }
            _ => {
                let record_name = RecordNaming::record_name(&self.hub_hash, key);
                self.delete_record(&record_name).await
            }
        }
    }
}
