//! In-memory repositories with API-server-like write semantics.
//!
//! Objects get a uid, a monotonically increasing resourceVersion and a
//! generation that bumps on spec changes. Deleting an object that still has
//! finalizers only stamps its deletionTimestamp; it disappears once the last
//! finalizer is removed. Every mutating call is counted so tests can assert
//! that a reconcile pass performed no writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;

use super::{Object, Repositories, Repository, Selector, matches_selector};
use crate::controller::{Error, Result};
use crate::crd::{AppBinding, DormantDatabase, MySQL, ProxySQL, RestoreSession, Snapshot};

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    versions: AtomicU64,
    pending_conflicts: AtomicU64,
}

type Key = (String, String);

pub struct MemoryRepository<K: Object> {
    objects: Mutex<BTreeMap<Key, K>>,
    counters: Arc<Counters>,
}

impl<K: Object> MemoryRepository<K> {
    fn new(counters: Arc<Counters>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            counters,
        }
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<Key, K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        (self.counters.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record_write(&self) {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of stored objects, including ones pending finalization
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Every stored object in key order
    pub fn all(&self) -> Vec<K> {
        self.objects().values().cloned().collect()
    }
}

fn now() -> Result<Time> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    Ok(serde_json::from_value(Value::String(stamp))?)
}

fn key_of<K: Object>(namespace: &str, object: &K) -> Result<Key> {
    let name = object
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    Ok((namespace.to_string(), name))
}

fn finalized<K: Object>(object: &K) -> bool {
    object.meta().deletion_timestamp.is_some()
        && object
            .meta()
            .finalizers
            .as_ref()
            .is_none_or(|finalizers| finalizers.is_empty())
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl<K: Object> Repository<K> for MemoryRepository<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self
            .objects()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        Ok(self
            .objects()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| matches_selector(obj.meta().labels.as_ref(), selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K> {
        self.record_write();
        let key = key_of(namespace, object)?;
        let mut objects = self.objects();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }

        let mut created = object.clone();
        let meta = created.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("uid-{}-{}", key.0, key.1));
        meta.generation = Some(1);
        meta.deletion_timestamp = None;
        meta.resource_version = Some(self.next_version());
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(&self, namespace: &str, object: &K) -> Result<K> {
        self.record_write();
        let key = key_of(namespace, object)?;

        let injected = self
            .counters
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Conflict(format!("{}/{}", key.0, key.1)));
        }

        let mut objects = self.objects();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", key.0, key.1)))?;

        if let Some(version) = &object.meta().resource_version {
            if stored.meta().resource_version.as_ref() != Some(version) {
                return Err(Error::Conflict(format!(
                    "{}/{}: resourceVersion {} is stale",
                    key.0, key.1, version
                )));
            }
        }

        // Status is owned by the status subresource; carry it over untouched.
        let stored_value = serde_json::to_value(stored)?;
        let mut value = serde_json::to_value(object)?;
        match stored_value.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut value {
                    map.remove("status");
                }
            }
        }
        let spec_changed = stored_value.get("spec") != value.get("spec");

        let mut replaced: K = serde_json::from_value(value)?;
        let stored_meta = stored.meta().clone();
        let meta = replaced.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid = stored_meta.uid;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        let generation = stored_meta.generation.unwrap_or(1);
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        meta.resource_version = Some(self.next_version());

        if finalized(&replaced) {
            objects.remove(&key);
        } else {
            objects.insert(key, replaced.clone());
        }
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.record_write();
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects();
        let Some(stored) = objects.get_mut(&key) else {
            return Ok(());
        };

        let has_finalizers = stored
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| !finalizers.is_empty());
        if has_finalizers {
            if stored.meta().deletion_timestamp.is_none() {
                let meta = stored.meta_mut();
                meta.deletion_timestamp = Some(now()?);
                meta.resource_version = Some(self.next_version());
            }
        } else {
            objects.remove(&key);
        }
        Ok(())
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<K> {
        self.record_write();
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("{namespace}/{name}")))?;

        let mut value = serde_json::to_value(stored)?;
        if let Value::Object(map) = &mut value {
            let current = map.entry("status".to_string()).or_insert(Value::Null);
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            merge_patch(current, &status);
        }
        let mut patched: K = serde_json::from_value(value)?;
        patched.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, patched.clone());
        Ok(patched)
    }
}

/// A full set of in-memory repositories sharing one write counter
pub struct MemoryCluster {
    counters: Arc<Counters>,
    pub mysqls: Arc<MemoryRepository<MySQL>>,
    pub proxysqls: Arc<MemoryRepository<ProxySQL>>,
    pub dormant_databases: Arc<MemoryRepository<DormantDatabase>>,
    pub snapshots: Arc<MemoryRepository<Snapshot>>,
    pub restore_sessions: Arc<MemoryRepository<RestoreSession>>,
    pub app_bindings: Arc<MemoryRepository<AppBinding>>,
    pub secrets: Arc<MemoryRepository<Secret>>,
    pub pvcs: Arc<MemoryRepository<PersistentVolumeClaim>>,
    pub statefulsets: Arc<MemoryRepository<StatefulSet>>,
    pub services: Arc<MemoryRepository<Service>>,
    pub pdbs: Arc<MemoryRepository<PodDisruptionBudget>>,
    pub jobs: Arc<MemoryRepository<Job>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let counters = Arc::new(Counters::default());
        Self {
            mysqls: Arc::new(MemoryRepository::new(counters.clone())),
            proxysqls: Arc::new(MemoryRepository::new(counters.clone())),
            dormant_databases: Arc::new(MemoryRepository::new(counters.clone())),
            snapshots: Arc::new(MemoryRepository::new(counters.clone())),
            restore_sessions: Arc::new(MemoryRepository::new(counters.clone())),
            app_bindings: Arc::new(MemoryRepository::new(counters.clone())),
            secrets: Arc::new(MemoryRepository::new(counters.clone())),
            pvcs: Arc::new(MemoryRepository::new(counters.clone())),
            statefulsets: Arc::new(MemoryRepository::new(counters.clone())),
            services: Arc::new(MemoryRepository::new(counters.clone())),
            pdbs: Arc::new(MemoryRepository::new(counters.clone())),
            jobs: Arc::new(MemoryRepository::new(counters.clone())),
            counters,
        }
    }

    pub fn repositories(&self) -> Repositories {
        Repositories {
            mysqls: self.mysqls.clone(),
            proxysqls: self.proxysqls.clone(),
            dormant_databases: self.dormant_databases.clone(),
            snapshots: self.snapshots.clone(),
            restore_sessions: self.restore_sessions.clone(),
            app_bindings: self.app_bindings.clone(),
            secrets: self.secrets.clone(),
            pvcs: self.pvcs.clone(),
            statefulsets: self.statefulsets.clone(),
            services: self.services.clone(),
            pdbs: self.pdbs.clone(),
            jobs: self.jobs.clone(),
        }
    }

    /// Mutating calls issued so far across all kinds
    pub fn writes(&self) -> u64 {
        self.counters.writes.load(Ordering::SeqCst)
    }

    /// Fail the next `count` replace calls with a conflict
    pub fn inject_conflicts(&self, count: u64) {
        self.counters
            .pending_conflicts
            .store(count, Ordering::SeqCst);
    }
}
