//! Uniform get/delete over arbitrary resource types on the spoke cluster.

use crate::crds::AppliedManifestResourceMeta;
use crate::tasks::types::{is_conflict, is_not_found, with_timeout, Error, Result};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Preconditions};
use kube::{Client, ResourceExt};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// What the cluster currently holds at a recorded coordinate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveResource {
    pub uid: String,
    /// Deletion requested, object still present
    pub terminating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The object at the coordinate is a different instance
    PreconditionFailed,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// `None` when nothing exists at the coordinate
    async fn get(&self, target: &AppliedManifestResourceMeta) -> Result<Option<LiveResource>>;

    /// Unconditional delete
    async fn delete(&self, target: &AppliedManifestResourceMeta) -> Result<DeleteOutcome>;

    /// Delete only if the live object still carries `uid`
    async fn delete_with_uid(
        &self,
        target: &AppliedManifestResourceMeta,
        uid: &str,
    ) -> Result<DeleteOutcome>;
}

pub struct KubeResourceClient {
    client: Client,
    timeout: Duration,
}

impl KubeResourceClient {
    #[must_use]
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, target: &AppliedManifestResourceMeta) -> Api<DynamicObject> {
        let resource = api_resource(target);
        if target.namespace.is_empty() {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), &target.namespace, &resource)
        }
    }

    async fn delete_with(
        &self,
        target: &AppliedManifestResourceMeta,
        params: DeleteParams,
    ) -> Result<DeleteOutcome> {
        let api = self.api(target);
        with_timeout(self.timeout, &format!("delete {target}"), async {
            match api.delete(&target.name, &params).await {
                Ok(_) => Ok(DeleteOutcome::Deleted),
                Err(e) if is_not_found(&e) => Ok(DeleteOutcome::NotFound),
                Err(e) if is_conflict(&e) && params.preconditions.is_some() => {
                    Ok(DeleteOutcome::PreconditionFailed)
                }
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }
}

/// Builds the dynamic descriptor for a recorded coordinate.
/// Kind is unknown from a reference and not needed for get/delete.
#[must_use]
pub fn api_resource(target: &AppliedManifestResourceMeta) -> ApiResource {
    let api_version = if target.group.is_empty() {
        target.version.clone()
    } else {
        format!("{}/{}", target.group, target.version)
    };
    ApiResource {
        group: target.group.clone(),
        version: target.version.clone(),
        api_version,
        kind: String::new(),
        plural: target.resource.clone(),
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, target: &AppliedManifestResourceMeta) -> Result<Option<LiveResource>> {
        let api = self.api(target);
        let found = with_timeout(self.timeout, &format!("get {target}"), async {
            Ok::<_, Error>(api.get_opt(&target.name).await?)
        })
        .await?;

        Ok(found.map(|obj| {
            let live = LiveResource {
                uid: obj.uid().unwrap_or_default(),
                terminating: obj.metadata.deletion_timestamp.is_some(),
            };
            debug!(resource = %target, uid = %live.uid, terminating = live.terminating, "Fetched live resource");
            live
        }))
    }

    async fn delete(&self, target: &AppliedManifestResourceMeta) -> Result<DeleteOutcome> {
        self.delete_with(target, DeleteParams::background()).await
    }

    async fn delete_with_uid(
        &self,
        target: &AppliedManifestResourceMeta,
        uid: &str,
    ) -> Result<DeleteOutcome> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::background()
        };
        self.delete_with(target, params).await
    }
}
