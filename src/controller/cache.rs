//! Watch cache
//!
//! One reflector per watched kind keeps a local store current and turns every
//! touched object into the queue keys it affects. Keys travel over an mpsc
//! channel to [`forward_keys`], which feeds the work queue. Reads of the
//! watched kinds are then served from the stores.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::queue::{QueueKey, WorkKind, WorkQueue};
use crate::controller::{Error, Result};
use crate::crd::{DatabasePhase, DormantDatabase, MySQL, ProxySQL, Snapshot};
use crate::health::HealthState;
use crate::resources::common::{KIND_MYSQL, LABEL_DATABASE_KIND, LABEL_DATABASE_NAME};
use crate::store::{KubeRepository, Object, Repositories};

/// Buffered keys between the watches and the queue
pub const KEY_CHANNEL_CAPACITY: usize = 1024;

/// Reflector stores for every watched kind
pub struct WatchCache {
    pub mysqls: Store<MySQL>,
    pub proxysqls: Store<ProxySQL>,
    pub dormant_databases: Store<DormantDatabase>,
    pub snapshots: Store<Snapshot>,
    pub statefulsets: Store<StatefulSet>,
    pub jobs: Store<Job>,
}

impl WatchCache {
    /// Start the watches; they stop when `shutdown` fires
    pub fn start(
        client: &Client,
        namespace: Option<&str>,
        tx: mpsc::Sender<QueueKey>,
        shutdown: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> Self {
        let watch = |name: &'static str| WatchSpawner {
            client,
            namespace,
            tx: tx.clone(),
            shutdown: shutdown.clone(),
            name,
        };
        let cache = Self {
            mysqls: watch("mysqls").spawn(tasks, mysql_keys),
            proxysqls: watch("proxysqls").spawn(tasks, proxysql_keys),
            dormant_databases: watch("dormantdatabases").spawn(tasks, dormant_keys),
            snapshots: watch("snapshots").spawn(tasks, snapshot_keys),
            statefulsets: watch("statefulsets").spawn(tasks, statefulset_keys),
            jobs: watch("jobs").spawn(tasks, job_keys),
        };
        info!(
            scope = namespace.unwrap_or("cluster-wide"),
            "Watch caches started"
        );
        cache
    }

    /// Wait for the initial list of every watched kind
    pub async fn wait_until_ready(&self) -> Result<()> {
        let not_ready = |e: reflector::store::WriterDropped| {
            Error::TransientError(format!("watch cache closed before sync: {e}"))
        };
        self.mysqls.wait_until_ready().await.map_err(not_ready)?;
        self.proxysqls.wait_until_ready().await.map_err(not_ready)?;
        self.dormant_databases
            .wait_until_ready()
            .await
            .map_err(not_ready)?;
        self.snapshots.wait_until_ready().await.map_err(not_ready)?;
        self.statefulsets.wait_until_ready().await.map_err(not_ready)?;
        self.jobs.wait_until_ready().await.map_err(not_ready)?;
        info!("Watch caches synced");
        Ok(())
    }

    /// Repositories reading watched kinds from the stores
    pub fn repositories(&self, client: &Client) -> Repositories {
        fn cached<K: Object>(client: &Client, store: &Store<K>) -> Arc<KubeRepository<K>> {
            Arc::new(KubeRepository::new(client.clone(), Some(store.clone())))
        }
        fn direct<K: Object>(client: &Client) -> Arc<KubeRepository<K>> {
            Arc::new(KubeRepository::new(client.clone(), None))
        }

        Repositories {
            mysqls: cached(client, &self.mysqls),
            proxysqls: cached(client, &self.proxysqls),
            dormant_databases: cached(client, &self.dormant_databases),
            snapshots: cached(client, &self.snapshots),
            statefulsets: cached(client, &self.statefulsets),
            jobs: cached(client, &self.jobs),
            restore_sessions: direct(client),
            app_bindings: direct(client),
            secrets: direct(client),
            pvcs: direct(client),
            services: direct(client),
            pdbs: direct(client),
        }
    }

    /// Queue every known MySQL, ProxySQL, DormantDatabase and Snapshot
    pub fn resync(&self, queue: &WorkQueue<QueueKey>) {
        let mysqls = self.mysqls.state();
        let proxysqls = self.proxysqls.state();
        let dormant_databases = self.dormant_databases.state();
        let snapshots = self.snapshots.state();
        let keys = mysqls
            .iter()
            .flat_map(|o| mysql_keys(o))
            .chain(proxysqls.iter().flat_map(|o| proxysql_keys(o)))
            .chain(dormant_databases.iter().flat_map(|o| dormant_keys(o)))
            .chain(snapshots.iter().flat_map(|o| snapshot_keys(o)));
        for key in keys {
            queue.add(key);
        }
    }
}

struct WatchSpawner<'a> {
    client: &'a Client,
    namespace: Option<&'a str>,
    tx: mpsc::Sender<QueueKey>,
    shutdown: CancellationToken,
    name: &'static str,
}

impl WatchSpawner<'_> {
    fn spawn<K, F>(self, tasks: &mut JoinSet<()>, keys: F) -> Store<K>
    where
        K: Object,
        F: Fn(&K) -> Vec<QueueKey> + Send + 'static,
    {
        let api: Api<K> = match self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let (reader, writer) = reflector::store();
        let stream = reflector::reflector(
            writer,
            watcher(api, watcher::Config::default().any_semantic()),
        )
        .default_backoff()
        .touched_objects();

        let Self {
            tx, shutdown, name, ..
        } = self;
        tasks.spawn(async move {
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = stream.next() => match event {
                        Some(Ok(object)) => {
                            for key in keys(&object) {
                                if tx.send(key).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => warn!(watch = name, error = %e, "Watch error"),
                        None => break,
                    },
                }
            }
            debug!(watch = name, "Watch stopped");
        });
        reader
    }
}

/// Move keys from the watches into the queue
pub async fn forward_keys(
    mut rx: mpsc::Receiver<QueueKey>,
    queue: Arc<WorkQueue<QueueKey>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            key = rx.recv() => match key {
                Some(key) => queue.add(key),
                None => break,
            },
        }
    }
}

fn key_for<K: Resource>(kind: WorkKind, object: &K) -> Option<QueueKey> {
    let meta = object.meta();
    Some(QueueKey::new(kind, meta.namespace.clone()?, meta.name.clone()?))
}

pub fn mysql_keys(mysql: &MySQL) -> Vec<QueueKey> {
    key_for(WorkKind::MySql, mysql).into_iter().collect()
}

pub fn proxysql_keys(proxysql: &ProxySQL) -> Vec<QueueKey> {
    key_for(WorkKind::ProxySql, proxysql).into_iter().collect()
}

/// A dormant database change may unblock a waiting resume
pub fn dormant_keys(dormant: &DormantDatabase) -> Vec<QueueKey> {
    [
        key_for(WorkKind::DormantDatabase, dormant),
        key_for(WorkKind::MySql, dormant),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Snapshot progress matters to the snapshot itself, its database's backup
/// overlap check and any database initializing from it
pub fn snapshot_keys(snapshot: &Snapshot) -> Vec<QueueKey> {
    let mut keys: Vec<_> = key_for(WorkKind::Snapshot, snapshot).into_iter().collect();
    if let Some(ns) = snapshot.namespace() {
        keys.push(QueueKey::mysql(ns, snapshot.spec.database_name.clone()));
    }
    keys
}

/// Owners by reference, plus the dormant database waiting for a paused
/// workload to disappear
pub fn statefulset_keys(sts: &StatefulSet) -> Vec<QueueKey> {
    let Some(ns) = sts.namespace() else {
        return Vec::new();
    };
    let mut keys = owner_keys(sts, &ns);
    let labels = sts.labels();
    if labels.get(LABEL_DATABASE_KIND).map(String::as_str) == Some(KIND_MYSQL) {
        if let Some(name) = labels.get(LABEL_DATABASE_NAME) {
            keys.push(QueueKey::new(WorkKind::DormantDatabase, &ns, name));
            let own = QueueKey::mysql(&ns, name);
            if !keys.contains(&own) {
                keys.push(own);
            }
        }
    }
    keys
}

pub fn job_keys(job: &Job) -> Vec<QueueKey> {
    match job.namespace() {
        Some(ns) => owner_keys(job, &ns),
        None => Vec::new(),
    }
}

fn owner_keys<K: ResourceExt>(object: &K, ns: &str) -> Vec<QueueKey> {
    object
        .owner_references()
        .iter()
        .filter(|o| o.api_version.starts_with("kubedb.com/"))
        .filter_map(|owner| {
            let kind = match owner.kind.as_str() {
                "MySQL" => WorkKind::MySql,
                "ProxySQL" => WorkKind::ProxySql,
                "Snapshot" => WorkKind::Snapshot,
                _ => return None,
            };
            Some(QueueKey::new(kind, ns, &owner.name))
        })
        .collect()
}

/// Number of databases in each phase; unrecorded phases count as Provisioning
pub fn phase_counts<'a>(mysqls: impl IntoIterator<Item = &'a MySQL>) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for mysql in mysqls {
        let phase = mysql.phase().unwrap_or(DatabasePhase::Provisioning);
        *counts.entry(phase.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Publish phase counts and queue depth every `interval`
pub async fn report_metrics(
    store: Store<MySQL>,
    queue: Arc<WorkQueue<QueueKey>>,
    health: Arc<HealthState>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    const PHASES: [DatabasePhase; 8] = [
        DatabasePhase::Provisioning,
        DatabasePhase::Initializing,
        DatabasePhase::Running,
        DatabasePhase::Resuming,
        DatabasePhase::Pausing,
        DatabasePhase::Paused,
        DatabasePhase::Terminating,
        DatabasePhase::Failed,
    ];
    loop {
        let state = store.state();
        let counts = phase_counts(state.iter().map(|m| m.as_ref()));
        for phase in PHASES {
            let phase = phase.to_string();
            let count = counts.get(&phase).copied().unwrap_or(0);
            health.metrics.set_databases_by_phase(&phase, count);
        }
        health.metrics.set_queue_depth(queue.len());

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
