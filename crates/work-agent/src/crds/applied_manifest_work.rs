//! `AppliedManifestWork` Custom Resource Definition
//!
//! Lives on the spoke cluster, one per (hub, `ManifestWork`). It records every
//! resource the agent created for the work so that deletion can later be
//! reversed safely. Physical removal is blocked by the agent's finalizer until
//! all recorded resources have been resolved.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "AppliedManifestWork"
)]
#[kube(status = "AppliedManifestWorkStatus")]
#[kube(printcolumn = r#"{"name":"Work","type":"string","jsonPath":".spec.manifestWorkName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AppliedManifestWorkSpec {
    /// Hash of the hub API server this record belongs to
    pub hub_hash: String,

    /// Name of the `ManifestWork` on the hub
    pub manifest_work_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedManifestWorkStatus {
    /// Resources created on the spoke for this work, in apply order
    #[serde(default)]
    pub applied_resources: Vec<AppliedManifestResourceMeta>,
}

/// One resource created on behalf of a work.
///
/// `uid` is empty for entries recorded before instance identity was captured.
/// Such entries are deleted unconditionally during finalization.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AppliedManifestResourceMeta {
    #[serde(default)]
    pub group: String,

    pub version: String,

    /// Plural resource name (e.g. `secrets`)
    pub resource: String,

    /// Empty for cluster scoped resources
    #[serde(default)]
    pub namespace: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl AppliedManifestResourceMeta {
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.uid.is_empty()
    }

    /// True when both entries address the same object, ignoring version and uid.
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.group == other.group
            && self.resource == other.resource
            && self.namespace == other.namespace
            && self.name == other.name
    }

    /// `group/version/resource` in the form used for log fields
    #[must_use]
    pub fn gvr(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

impl std::fmt::Display for AppliedManifestResourceMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.gvr(), self.name)
        } else {
            write!(f, "{} {}/{}", self.gvr(), self.namespace, self.name)
        }
    }
}

impl AppliedManifestWork {
    /// Recorded resources, empty when no status has been written yet
    #[must_use]
    pub fn applied_resources(&self) -> &[AppliedManifestResourceMeta] {
        self.status
            .as_ref()
            .map_or(&[], |status| status.applied_resources.as_slice())
    }

    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers().iter().any(|f| f == token)
    }

    /// Adds `token` at the end of the finalizer list. Returns false if already present.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers_mut().push(token.to_string());
        true
    }

    /// Removes every occurrence of `token`, keeping the order of the others.
    /// Returns false if it was not present.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        if !self.has_finalizer(token) {
            return false;
        }
        self.finalizers_mut().retain(|f| f != token);
        true
    }

    pub fn set_applied_resources(&mut self, resources: Vec<AppliedManifestResourceMeta>) {
        self.status
            .get_or_insert_with(AppliedManifestWorkStatus::default)
            .applied_resources = resources;
    }
}
