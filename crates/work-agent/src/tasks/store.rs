//! Access to `AppliedManifestWork` records on the spoke cluster.
//!
//! Every write goes through [`update_record`] or [`update_record_status`]:
//! the record is re-read, the mutation is applied to the fresh copy and the
//! result is written back. A stale write (409) is retried in place a bounded
//! number of times before surfacing as [`Error::Conflict`].

use crate::crds::AppliedManifestWork;
use crate::tasks::types::{is_conflict, is_not_found, with_timeout, Error, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<AppliedManifestWork>>;

    async fn list(&self) -> Result<Vec<AppliedManifestWork>>;

    async fn create(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork>;

    /// Write metadata and spec. Fails with `Conflict` if the copy is stale.
    async fn replace(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork>;

    /// Write the status subresource. Fails with `Conflict` if the copy is stale.
    async fn replace_status(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork>;

    /// Request deletion with foreground propagation. Returns false if already gone.
    async fn delete(&self, name: &str) -> Result<bool>;
}

pub struct KubeRecordStore {
    api: Api<AppliedManifestWork>,
    timeout: Duration,
}

impl KubeRecordStore {
    #[must_use]
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            api: Api::all(client),
            timeout,
        }
    }
}

fn map_write_error(name: &str, err: kube::Error) -> Error {
    if is_conflict(&err) {
        Error::Conflict(format!("appliedmanifestwork {name}"))
    } else {
        Error::KubeError(err)
    }
}

#[async_trait]
impl RecordStore for KubeRecordStore {
    async fn get(&self, name: &str) -> Result<Option<AppliedManifestWork>> {
        with_timeout(self.timeout, &format!("get appliedmanifestwork {name}"), async {
            Ok::<_, Error>(self.api.get_opt(name).await?)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<AppliedManifestWork>> {
        with_timeout(self.timeout, "list appliedmanifestworks", async {
            Ok::<_, Error>(self.api.list(&ListParams::default()).await?.items)
        })
        .await
    }

    async fn create(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork> {
        let name = record.name_any();
        with_timeout(self.timeout, &format!("create appliedmanifestwork {name}"), async {
            self.api
                .create(&PostParams::default(), record)
                .await
                .map_err(|e| map_write_error(&name, e))
        })
        .await
    }

    async fn replace(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork> {
        let name = record.name_any();
        with_timeout(self.timeout, &format!("update appliedmanifestwork {name}"), async {
            self.api
                .replace(&name, &PostParams::default(), record)
                .await
                .map_err(|e| map_write_error(&name, e))
        })
        .await
    }

    async fn replace_status(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork> {
        let name = record.name_any();
        let body = serde_json::to_vec(record)?;
        with_timeout(
            self.timeout,
            &format!("update appliedmanifestwork {name} status"),
            async {
                self.api
                    .replace_status(&name, &PostParams::default(), body)
                    .await
                    .map_err(|e| map_write_error(&name, e))
            },
        )
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        with_timeout(self.timeout, &format!("delete appliedmanifestwork {name}"), async {
            match self.api.delete(name, &DeleteParams::foreground()).await {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Metadata,
    Status,
}

/// Re-read `name`, apply `mutate` and write metadata/spec back.
///
/// `mutate` returns whether it changed anything; nothing is written otherwise.
/// Returns `None` if the record no longer exists, else the record as stored.
pub async fn update_record<F>(
    store: &dyn RecordStore,
    name: &str,
    conflict_retries: u32,
    mutate: F,
) -> Result<Option<AppliedManifestWork>>
where
    F: FnMut(&mut AppliedManifestWork) -> bool + Send,
{
    update_with_retry(store, name, conflict_retries, Target::Metadata, mutate).await
}

/// Same as [`update_record`] but writes the status subresource.
pub async fn update_record_status<F>(
    store: &dyn RecordStore,
    name: &str,
    conflict_retries: u32,
    mutate: F,
) -> Result<Option<AppliedManifestWork>>
where
    F: FnMut(&mut AppliedManifestWork) -> bool + Send,
{
    update_with_retry(store, name, conflict_retries, Target::Status, mutate).await
}

async fn update_with_retry<F>(
    store: &dyn RecordStore,
    name: &str,
    conflict_retries: u32,
    target: Target,
    mut mutate: F,
) -> Result<Option<AppliedManifestWork>>
where
    F: FnMut(&mut AppliedManifestWork) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        let Some(mut record) = store.get(name).await? else {
            debug!(record = %name, "Record gone before update");
            return Ok(None);
        };

        if !mutate(&mut record) {
            return Ok(Some(record));
        }

        let written = match target {
            Target::Metadata => store.replace(&record).await,
            Target::Status => store.replace_status(&record).await,
        };

        match written {
            Ok(updated) => return Ok(Some(updated)),
            Err(Error::Conflict(what)) if attempt < conflict_retries => {
                attempt += 1;
                info!(record = %name, attempt, ?target, "Conflict on {}, re-reading", what);
            }
            Err(e) => return Err(e),
        }
    }
}
