use crate::crds::ManifestWork;
use crate::tasks::types::{with_timeout, Error, Result};
use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use std::time::Duration;

/// Read access to the `ManifestWork`s addressed to this cluster on the hub
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ManifestWork>>;

    async fn list(&self) -> Result<Vec<ManifestWork>>;
}

pub struct KubeWorkSource {
    api: Api<ManifestWork>,
    timeout: Duration,
}

impl KubeWorkSource {
    /// Works for a managed cluster live in the hub namespace named after it
    #[must_use]
    pub fn new(hub: Client, cluster_name: &str, timeout: Duration) -> Self {
        Self {
            api: Api::namespaced(hub, cluster_name),
            timeout,
        }
    }

    #[must_use]
    pub fn api(&self) -> Api<ManifestWork> {
        self.api.clone()
    }
}

#[async_trait]
impl WorkSource for KubeWorkSource {
    async fn get(&self, name: &str) -> Result<Option<ManifestWork>> {
        with_timeout(self.timeout, &format!("get manifestwork {name}"), async {
            Ok::<_, Error>(self.api.get_opt(name).await?)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ManifestWork>> {
        with_timeout(self.timeout, "list manifestworks", async {
            Ok::<_, Error>(self.api.list(&ListParams::default()).await?.items)
        })
        .await
    }
}
