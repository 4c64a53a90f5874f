//! In-memory stand-ins for the spoke API server, shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use work_agent::crds::{
    AppliedManifestResourceMeta, AppliedManifestWork, AppliedManifestWorkSpec, ManifestWork,
    ManifestWorkSpec, ManifestsTemplate,
};
use work_agent::tasks::apply::{ManifestApplier, WorkSource};
use work_agent::tasks::resources::{DeleteOutcome, LiveResource, ResourceClient};
use work_agent::tasks::store::RecordStore;
use work_agent::tasks::types::{Error, Result, APPLIED_MANIFEST_WORK_FINALIZER};

pub const HUB: &str = "hub";

pub fn entry(name: &str, uid: &str) -> AppliedManifestResourceMeta {
    AppliedManifestResourceMeta {
        version: "v1".to_string(),
        resource: "secrets".to_string(),
        namespace: "ns1".to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        ..Default::default()
    }
}

pub fn record(name: &str, entries: Vec<AppliedManifestResourceMeta>) -> AppliedManifestWork {
    let mut record = AppliedManifestWork::new(
        name,
        AppliedManifestWorkSpec {
            hub_hash: HUB.to_string(),
            manifest_work_name: "work".to_string(),
        },
    );
    record.metadata = ObjectMeta {
        name: Some(name.to_string()),
        uid: Some(format!("{name}-uid")),
        finalizers: Some(vec![
            "a".to_string(),
            APPLIED_MANIFEST_WORK_FINALIZER.to_string(),
            "b".to_string(),
        ]),
        ..Default::default()
    };
    record.set_applied_resources(entries);
    record
}

pub fn deleting(mut record: AppliedManifestWork) -> AppliedManifestWork {
    record.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    record
}

/// Record store with resourceVersion checks and an action log
#[derive(Default)]
pub struct FakeStore {
    records: Mutex<HashMap<String, AppliedManifestWork>>,
    actions: Mutex<Vec<String>>,
    /// Bumps the stored version behind the writer's back this many times
    pub racing_writes: Mutex<u32>,
    /// Records an entry behind the writer's back before the next write with the given verb
    pub interleaved: Mutex<Vec<(String, AppliedManifestResourceMeta)>>,
}

impl FakeStore {
    pub fn with(records: Vec<AppliedManifestWork>) -> Self {
        let store = FakeStore::default();
        for mut record in records {
            record.metadata.resource_version = Some("1".to_string());
            store
                .records
                .lock()
                .unwrap()
                .insert(record.name_any(), record);
        }
        store
    }

    pub fn record(&self, name: &str) -> Option<AppliedManifestWork> {
        self.records.lock().unwrap().get(name).cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.actions().iter().filter(|a| *a == verb).count()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().unwrap().clear();
    }

    fn log(&self, verb: &str) {
        self.actions.lock().unwrap().push(verb.to_string());
    }

    fn write(&self, verb: &str, incoming: &AppliedManifestWork, status_only: bool) -> Result<AppliedManifestWork> {
        self.log(verb);
        let name = incoming.name_any();
        let mut records = self.records.lock().unwrap();
        let current = records
            .get_mut(&name)
            .ok_or_else(|| Error::Conflict(format!("appliedmanifestwork {name} not found")))?;

        {
            let mut racing = self.racing_writes.lock().unwrap();
            if *racing > 0 {
                *racing -= 1;
                bump(current);
            }
        }
        {
            let mut interleaved = self.interleaved.lock().unwrap();
            if let Some(pos) = interleaved.iter().position(|(v, _)| v == verb) {
                let (_, extra) = interleaved.remove(pos);
                let mut entries = current.applied_resources().to_vec();
                entries.push(extra);
                current.set_applied_resources(entries);
                bump(current);
            }
        }
        if current.metadata.resource_version != incoming.metadata.resource_version {
            return Err(Error::Conflict(format!("appliedmanifestwork {name}")));
        }

        if status_only {
            current.status = incoming.status.clone();
        } else {
            current.metadata.finalizers = incoming.metadata.finalizers.clone();
            current.spec = incoming.spec.clone();
        }
        bump(current);
        let stored = current.clone();

        if stored.is_deleting() && stored.finalizers().is_empty() {
            records.remove(&name);
        }
        Ok(stored)
    }
}

fn bump(record: &mut AppliedManifestWork) {
    let next = record
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    record.metadata.resource_version = Some(next.to_string());
}

#[async_trait]
impl RecordStore for FakeStore {
    async fn get(&self, name: &str) -> Result<Option<AppliedManifestWork>> {
        self.log("get");
        Ok(self.record(name))
    }

    async fn list(&self) -> Result<Vec<AppliedManifestWork>> {
        self.log("list");
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn create(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork> {
        self.log("create");
        let name = record.name_any();
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&name) {
            return Err(Error::Conflict(format!("appliedmanifestwork {name} exists")));
        }
        let mut stored = record.clone();
        stored.metadata.uid = Some(format!("{name}-uid"));
        stored.metadata.resource_version = Some("1".to_string());
        records.insert(name, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork> {
        self.write("update", record, false)
    }

    async fn replace_status(&self, record: &AppliedManifestWork) -> Result<AppliedManifestWork> {
        self.write("update-status", record, true)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.log("delete");
        let mut records = self.records.lock().unwrap();
        let Some(current) = records.get_mut(name) else {
            return Ok(false);
        };
        if current.finalizers().is_empty() {
            records.remove(name);
        } else if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            bump(current);
        }
        Ok(true)
    }
}

type Key = (String, String, String, String);

fn key(target: &AppliedManifestResourceMeta) -> Key {
    (
        target.group.clone(),
        target.resource.clone(),
        target.namespace.clone(),
        target.name.clone(),
    )
}

/// Spoke objects addressed by coordinate, with an action log
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<Key, LiveResource>>,
    actions: Mutex<Vec<(String, String)>>,
    /// Deleted objects linger as terminating instead of vanishing
    pub hold_on_delete: bool,
}

impl FakeCluster {
    pub fn holding() -> Self {
        Self {
            hold_on_delete: true,
            ..Self::default()
        }
    }

    pub fn put(&self, target: &AppliedManifestResourceMeta, uid: &str, terminating: bool) {
        self.objects.lock().unwrap().insert(
            key(target),
            LiveResource {
                uid: uid.to_string(),
                terminating,
            },
        );
    }

    pub fn remove(&self, target: &AppliedManifestResourceMeta) {
        self.objects.lock().unwrap().remove(&key(target));
    }

    pub fn live(&self, target: &AppliedManifestResourceMeta) -> Option<LiveResource> {
        self.objects.lock().unwrap().get(&key(target)).cloned()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| v == verb)
            .count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| v.starts_with("delete"))
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().unwrap().clear();
    }

    fn log(&self, verb: &str, target: &AppliedManifestResourceMeta) {
        self.actions
            .lock()
            .unwrap()
            .push((verb.to_string(), target.name.clone()));
    }

    fn remove_or_hold(&self, target: &AppliedManifestResourceMeta) -> DeleteOutcome {
        let mut objects = self.objects.lock().unwrap();
        if self.hold_on_delete {
            match objects.get_mut(&key(target)) {
                Some(live) => {
                    live.terminating = true;
                    DeleteOutcome::Deleted
                }
                None => DeleteOutcome::NotFound,
            }
        } else if objects.remove(&key(target)).is_some() {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        }
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn get(&self, target: &AppliedManifestResourceMeta) -> Result<Option<LiveResource>> {
        self.log("get", target);
        Ok(self.live(target))
    }

    async fn delete(&self, target: &AppliedManifestResourceMeta) -> Result<DeleteOutcome> {
        self.log("delete", target);
        Ok(self.remove_or_hold(target))
    }

    async fn delete_with_uid(
        &self,
        target: &AppliedManifestResourceMeta,
        uid: &str,
    ) -> Result<DeleteOutcome> {
        self.log("delete-with-uid", target);
        match self.live(target) {
            Some(live) if live.uid != uid => Ok(DeleteOutcome::PreconditionFailed),
            _ => Ok(self.remove_or_hold(target)),
        }
    }
}

/// Hub works by name
#[derive(Default)]
pub struct FakeWorkSource {
    works: Mutex<HashMap<String, ManifestWork>>,
}

impl FakeWorkSource {
    pub fn set(&self, name: &str, manifests: Vec<Value>) {
        let mut work = ManifestWork::new(
            name,
            ManifestWorkSpec {
                workload: ManifestsTemplate { manifests },
            },
        );
        work.metadata.namespace = Some("cluster1".to_string());
        self.works.lock().unwrap().insert(name.to_string(), work);
    }

    pub fn remove(&self, name: &str) {
        self.works.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl WorkSource for FakeWorkSource {
    async fn get(&self, name: &str) -> Result<Option<ManifestWork>> {
        Ok(self.works.lock().unwrap().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ManifestWork>> {
        Ok(self.works.lock().unwrap().values().cloned().collect())
    }
}

/// Applies `Secret` manifests by recording them in a [`FakeCluster`].
/// A manifest named `broken` fails to apply.
pub struct FakeApplier {
    pub cluster: Arc<FakeCluster>,
    pub owners: Mutex<Vec<OwnerReference>>,
}

impl FakeApplier {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            owners: Mutex::new(Vec::new()),
        }
    }
}

pub fn secret_manifest(name: &str) -> Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": name, "namespace": "ns1"}
    })
}

#[async_trait]
impl ManifestApplier for FakeApplier {
    async fn apply(
        &self,
        manifest: &Value,
        owner: &OwnerReference,
    ) -> Result<AppliedManifestResourceMeta> {
        self.owners.lock().unwrap().push(owner.clone());
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::InvalidManifest("no name".to_string()))?;
        if name == "broken" {
            return Err(Error::Timeout(format!("apply {name}")));
        }
        let mut reference = entry(name, "");
        reference.uid = match self.cluster.live(&reference) {
            Some(live) => live.uid,
            None => {
                let uid = format!("{name}-live");
                self.cluster.put(&reference, &uid, false);
                uid
            }
        };
        Ok(reference)
    }
}
