//! Resolution of recorded resources.
//!
//! An entry is resolved once the agent can prove the instance it created is
//! gone or is no longer the one at the recorded coordinate. Everything else
//! stays pending and keeps its owner alive.

use crate::crds::AppliedManifestResourceMeta;
use crate::tasks::resources::{DeleteOutcome, ResourceClient};
use crate::tasks::types::{Error, Result};
use tracing::{debug, info, instrument, warn};

/// Why an entry left the tracked set, or that it did not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Legacy entry, delete issued
    Deleted,
    /// Nothing at the coordinate
    Absent,
    /// A different instance lives at the coordinate
    Replaced,
    /// The tracked instance still exists (maybe terminating)
    Present,
}

impl EntryState {
    #[must_use]
    pub fn is_resolved(self) -> bool {
        !matches!(self, EntryState::Present)
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub resolved: Vec<AppliedManifestResourceMeta>,
    pub pending: Vec<AppliedManifestResourceMeta>,
    pub errors: Vec<Error>,
}

impl Resolution {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty() && self.errors.is_empty()
    }
}

/// Check one entry against the cluster.
///
/// Legacy entries (no uid) are deleted outright. Identity-tracked entries are
/// only observed; their deletion is requested by whoever dropped them.
pub async fn resolve_entry(
    client: &dyn ResourceClient,
    entry: &AppliedManifestResourceMeta,
) -> Result<EntryState> {
    if entry.is_legacy() {
        return Ok(match client.delete(entry).await? {
            DeleteOutcome::Deleted => EntryState::Deleted,
            // no uid precondition on this delete, so it cannot fail one
            DeleteOutcome::NotFound | DeleteOutcome::PreconditionFailed => EntryState::Absent,
        });
    }

    Ok(match client.get(entry).await? {
        None => EntryState::Absent,
        Some(live) if live.uid != entry.uid => EntryState::Replaced,
        Some(live) => {
            debug!(resource = %entry, terminating = live.terminating, "Tracked instance still present");
            EntryState::Present
        }
    })
}

/// Resolve every entry in `entries`. A failing entry counts as pending and
/// its error is collected; the remaining entries are still processed.
#[instrument(skip(client, entries), fields(entries = entries.len()))]
pub async fn resolve_applied_resources(
    client: &dyn ResourceClient,
    entries: &[AppliedManifestResourceMeta],
    reason: &str,
) -> Resolution {
    let mut resolution = Resolution::default();

    for entry in entries {
        match resolve_entry(client, entry).await {
            Ok(state) if state.is_resolved() => {
                info!(resource = %entry, ?state, "Resource resolved: {}", reason);
                resolution.resolved.push(entry.clone());
            }
            Ok(_) => resolution.pending.push(entry.clone()),
            Err(err) => {
                warn!(resource = %entry, error = %err, "Failed to resolve resource");
                resolution.pending.push(entry.clone());
                resolution.errors.push(err);
            }
        }
    }

    resolution
}
