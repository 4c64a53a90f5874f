//! Server-side apply of raw manifests onto the spoke cluster.

use crate::crds::{AppliedManifestResourceMeta, AppliedManifestWork};
use crate::tasks::types::{with_timeout, Error, Result, FIELD_MANAGER};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply one manifest owned by `owner`, returning the reference to record.
    async fn apply(
        &self,
        manifest: &Value,
        owner: &OwnerReference,
    ) -> Result<AppliedManifestResourceMeta>;
}

/// Owner reference stamped on every applied object so the cluster garbage
/// collector removes it when the record is deleted in the foreground.
pub fn owner_reference(record: &AppliedManifestWork) -> Result<OwnerReference> {
    let uid = record.uid().ok_or(Error::MissingObjectKey)?;
    Ok(OwnerReference {
        api_version: AppliedManifestWork::api_version(&()).into_owned(),
        kind: AppliedManifestWork::kind(&()).into_owned(),
        name: record.name_any(),
        uid,
        ..Default::default()
    })
}

/// Splits `apps/v1` into `("apps", "v1")` and `v1` into `("", "v1")`
#[must_use]
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Decode a manifest and check it names a kind and an object.
pub fn parse_manifest(manifest: &Value) -> Result<(DynamicObject, GroupVersionKind)> {
    let obj: DynamicObject = serde_json::from_value(manifest.clone())
        .map_err(|e| Error::InvalidManifest(e.to_string()))?;

    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::InvalidManifest("missing apiVersion or kind".to_string()))?;
    if types.kind.is_empty() || types.api_version.is_empty() {
        return Err(Error::InvalidManifest(
            "apiVersion and kind must not be empty".to_string(),
        ));
    }
    if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::InvalidManifest(format!(
            "{} has no metadata.name",
            types.kind
        )));
    }

    let (group, version) = split_api_version(&types.api_version);
    let gvk = GroupVersionKind::gvk(group, version, &types.kind);
    Ok((obj, gvk))
}

pub struct KubeManifestApplier {
    client: Client,
    timeout: Duration,
    discovered: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl KubeManifestApplier {
    #[must_use]
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            discovered: RwLock::new(HashMap::new()),
        }
    }

    /// Resource descriptor and namespaced flag for `gvk`, cached per kind
    async fn discover(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(found) = self.discovered.read().await.get(&key) {
            return Ok(found.clone());
        }

        let (resource, caps) = with_timeout(self.timeout, &format!("discover {key}"), async {
            Ok::<_, Error>(pinned_kind(&self.client, gvk).await?)
        })
        .await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(kind = %key, plural = %resource.plural, namespaced, "Discovered resource");

        self.discovered
            .write()
            .await
            .insert(key, (resource.clone(), namespaced));
        Ok((resource, namespaced))
    }
}

#[async_trait]
impl ManifestApplier for KubeManifestApplier {
    async fn apply(
        &self,
        manifest: &Value,
        owner: &OwnerReference,
    ) -> Result<AppliedManifestResourceMeta> {
        let (mut obj, gvk) = parse_manifest(manifest)?;
        let (resource, namespaced) = self.discover(&gvk).await?;
        let name = obj.name_any();

        obj.metadata.resource_version = None;
        obj.metadata.managed_fields = None;
        obj.metadata.namespace = if namespaced {
            Some(
                obj.metadata
                    .namespace
                    .take()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| "default".to_string()),
            )
        } else {
            None
        };
        let owners = obj.owner_references_mut();
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner.clone());
        }

        let api: Api<DynamicObject> = match obj.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let applied = with_timeout(
            self.timeout,
            &format!("apply {} {}", gvk.kind, name),
            async { Ok::<_, Error>(api.patch(&name, &params, &Patch::Apply(&obj)).await?) },
        )
        .await?;

        let uid = applied.uid().ok_or(Error::MissingObjectKey)?;
        info!(kind = %gvk.kind, name = %name, uid = %uid, "Applied manifest");

        Ok(AppliedManifestResourceMeta {
            group: resource.group,
            version: resource.version,
            resource: resource.plural,
            namespace: obj.metadata.namespace.unwrap_or_default(),
            name,
            uid,
        })
    }
}
