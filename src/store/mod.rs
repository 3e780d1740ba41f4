//! Typed access to cluster objects.
//!
//! Controllers never talk to `kube::Api` directly; they go through a
//! [`Repository`] per kind, bundled in [`Repositories`]. The kube-backed
//! implementation reads from the watch cache and writes to the API server.
//! The in-memory implementation backs the unit tests.

mod api;
mod memory;

pub use api::KubeRepository;
pub use memory::{MemoryCluster, MemoryRepository};

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use kube::Resource;
use kube::core::NamespaceResourceScope;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::Result;
use crate::crd::{AppBinding, DormantDatabase, MySQL, ProxySQL, RestoreSession, Snapshot};

/// Label equality selector
pub type Selector = BTreeMap<String, String>;

/// Bounds shared by every kind the operator stores
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// CRUD over one namespaced kind. Watching is provided by the watch cache.
#[async_trait]
pub trait Repository<K: Object>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Objects in `namespace` carrying every label in `selector`
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>>;

    /// Fails with `AlreadyExists` when the name is taken
    async fn create(&self, namespace: &str, object: &K) -> Result<K>;

    /// Fails with `Conflict` when `object`'s resourceVersion is stale
    async fn replace(&self, namespace: &str, object: &K) -> Result<K>;

    /// Already-absent objects count as deleted
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge-patch the status subresource
    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K>;
}

/// One repository per kind the controllers touch
#[derive(Clone)]
pub struct Repositories {
    pub mysqls: Arc<dyn Repository<MySQL>>,
    pub proxysqls: Arc<dyn Repository<ProxySQL>>,
    pub dormant_databases: Arc<dyn Repository<DormantDatabase>>,
    pub snapshots: Arc<dyn Repository<Snapshot>>,
    pub restore_sessions: Arc<dyn Repository<RestoreSession>>,
    pub app_bindings: Arc<dyn Repository<AppBinding>>,
    pub secrets: Arc<dyn Repository<Secret>>,
    pub pvcs: Arc<dyn Repository<PersistentVolumeClaim>>,
    pub statefulsets: Arc<dyn Repository<StatefulSet>>,
    pub services: Arc<dyn Repository<Service>>,
    pub pdbs: Arc<dyn Repository<PodDisruptionBudget>>,
    pub jobs: Arc<dyn Repository<Job>>,
}

impl Repositories {
    /// Every kind read straight from the API server, for callers without a
    /// watch cache such as the admission webhook
    pub fn direct(client: &kube::Client) -> Self {
        fn direct<K: Object>(client: &kube::Client) -> Arc<KubeRepository<K>> {
            Arc::new(KubeRepository::new(client.clone(), None))
        }

        Self {
            mysqls: direct(client),
            proxysqls: direct(client),
            dormant_databases: direct(client),
            snapshots: direct(client),
            restore_sessions: direct(client),
            app_bindings: direct(client),
            secrets: direct(client),
            pvcs: direct(client),
            statefulsets: direct(client),
            services: direct(client),
            pdbs: direct(client),
            jobs: direct(client),
        }
    }
}

/// Whether `labels` carries every entry of `selector`
pub fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &Selector) -> bool {
    selector.iter().all(|(key, value)| {
        labels
            .and_then(|labels| labels.get(key))
            .is_some_and(|v| v == value)
    })
}

/// `k1=v1,k2=v2` form used by list calls
pub fn selector_string(selector: &Selector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
