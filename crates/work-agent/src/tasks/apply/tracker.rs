//! Keeps a live record's tracked list in step with what was last applied.
//!
//! Entries whose target is no longer part of the work are dropped through
//! the same resolution step the finalizer uses, so a dropped entry leaves the
//! list only once its instance is provably gone or replaced.

use crate::crds::AppliedManifestResourceMeta;
use crate::tasks::finalize::resolve_applied_resources;
use crate::tasks::resources::{DeleteOutcome, ResourceClient};
use crate::tasks::store::{update_record_status, RecordStore};
use crate::tasks::types::{Error, Result};
use tracing::{debug, info, instrument};

/// Issue a uid-preconditioned delete for every identity-tracked entry whose
/// instance is still live and not yet terminating. Legacy entries are left
/// to the resolver, which deletes them unconditionally.
pub async fn request_deletion(
    client: &dyn ResourceClient,
    entries: &[AppliedManifestResourceMeta],
) -> Vec<Error> {
    let mut errors = Vec::new();

    for entry in entries.iter().filter(|e| !e.is_legacy()) {
        let live = match client.get(entry).await {
            Ok(live) => live,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };

        match live {
            Some(live) if live.uid == entry.uid && !live.terminating => {
                match client.delete_with_uid(entry, &entry.uid).await {
                    Ok(DeleteOutcome::Deleted) => {
                        info!(resource = %entry, uid = %entry.uid, "🗑️ Deletion requested");
                    }
                    Ok(outcome) => debug!(resource = %entry, ?outcome, "Nothing to delete"),
                    Err(err) => errors.push(err),
                }
            }
            _ => {}
        }
    }

    errors
}

/// Entries of `tracked` whose target is absent from `applied`
#[must_use]
pub fn dropped_entries(
    tracked: &[AppliedManifestResourceMeta],
    applied: &[AppliedManifestResourceMeta],
) -> Vec<AppliedManifestResourceMeta> {
    tracked
        .iter()
        .filter(|entry| !applied.iter().any(|a| a.same_target(entry)))
        .cloned()
        .collect()
}

/// Reconcile the tracked list of `record_name` with the references produced
/// by the latest apply.
///
/// When `apply_complete` is false nothing is pruned: previously tracked
/// targets that were not re-applied this round are kept. Returns whether
/// dropped entries are still waiting to disappear.
#[instrument(skip(store, client, applied), fields(applied = applied.len()))]
pub async fn sync_applied_resources(
    store: &dyn RecordStore,
    client: &dyn ResourceClient,
    record_name: &str,
    applied: Vec<AppliedManifestResourceMeta>,
    apply_complete: bool,
    conflict_retries: u32,
) -> Result<bool> {
    let Some(record) = store.get(record_name).await? else {
        return Ok(false);
    };
    if record.is_deleting() {
        debug!("Record is being finalized, leaving tracked list alone");
        return Ok(false);
    }

    let tracked = record.applied_resources();
    let dropped = if apply_complete {
        dropped_entries(tracked, &applied)
    } else {
        Vec::new()
    };

    let mut errors = request_deletion(client, &dropped).await;
    let resolution =
        resolve_applied_resources(client, &dropped, "manifest removed from work").await;
    errors.extend(resolution.errors);

    // merged against each fresh read so concurrent entries survive a retry
    let resolved = resolution.resolved;
    update_record_status(store, record_name, conflict_retries, |fresh| {
        if fresh.is_deleting() {
            return false;
        }
        let mut desired = applied.clone();
        for entry in fresh.applied_resources() {
            if !resolved.contains(entry) && !desired.iter().any(|d| d.same_target(entry)) {
                desired.push(entry.clone());
            }
        }
        if fresh.applied_resources() == desired.as_slice() {
            return false;
        }
        fresh.set_applied_resources(desired);
        true
    })
    .await?;

    Error::aggregate(errors)?;
    Ok(!resolution.pending.is_empty())
}
