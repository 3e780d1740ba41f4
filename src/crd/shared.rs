//! Types shared between the MySQL, ProxySQL, DormantDatabase and Snapshot kinds.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happens to a database's storage, secrets and snapshots when the
/// database object is deleted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Archive into a DormantDatabase; keep PVCs, secrets and snapshots
    #[default]
    Pause,
    /// Delete PVCs; keep secrets and snapshots
    Delete,
    /// Delete PVCs, operator-managed secrets and snapshots
    WipeOut,
    /// Refuse deletion
    DoNotTerminate,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::Pause => write!(f, "Pause"),
            TerminationPolicy::Delete => write!(f, "Delete"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
        }
    }
}

/// Whether data lives on persistent volumes or on pod-local scratch space
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum StorageType {
    #[default]
    Durable,
    Ephemeral,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Durable => write!(f, "Durable"),
            StorageType::Ephemeral => write!(f, "Ephemeral"),
        }
    }
}

/// Persistent volume claim parameters
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses the cluster default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Requested size (e.g., "1Gi", "50Gi")
    pub size: String,

    /// Access modes, ReadWriteOnce when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

/// Compute resource requests and limits
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// A plain environment variable
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Pod-level customisation applied to generated workloads and jobs
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Reference to a Secret in the object's namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub secret_name: String,
}

/// Reference to a named object in the same namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Service customisation for the primary service
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// ClusterIP, NodePort or LoadBalancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Database initialization source. At most one field may be set.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_source: Option<ScriptSourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stash_restore_session: Option<LocalObjectReference>,
}

/// Init scripts executed by the MySQL entrypoint on first start
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSourceSpec {
    /// ConfigMap whose keys are script files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<LocalObjectReference>,

    /// Git repository cloned into the script directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<GitRepoSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoSpec {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Snapshot to restore from
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSourceSpec {
    /// Defaults to the database's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Periodic backup declaration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// 5-field cron expression, `@hourly`-style macro or `@every <duration>`
    pub cron_expression: String,

    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<StorageType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_volume_claim_spec: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,
}

/// Backup destination. Exactly one provider must be configured.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageBackend {
    /// Secret holding provider credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalBackend>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Backend>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<BucketBackend>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<ContainerBackend>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<ContainerBackend>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackend {
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    /// Existing claim backing the local repository; emptyDir when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Backend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BucketBackend {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBackend {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// The provider selected in a [`StorageBackend`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendProvider {
    Local,
    S3,
    Gcs,
    Azure,
    Swift,
}

impl std::fmt::Display for BackendProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendProvider::Local => write!(f, "local"),
            BackendProvider::S3 => write!(f, "s3"),
            BackendProvider::Gcs => write!(f, "gcs"),
            BackendProvider::Azure => write!(f, "azure"),
            BackendProvider::Swift => write!(f, "swift"),
        }
    }
}

impl StorageBackend {
    /// Returns the single configured provider, or a message describing why
    /// the backend is unusable.
    pub fn provider(&self) -> Result<BackendProvider, String> {
        let configured: Vec<BackendProvider> = [
            (self.local.is_some(), BackendProvider::Local),
            (self.s3.is_some(), BackendProvider::S3),
            (self.gcs.is_some(), BackendProvider::Gcs),
            (self.azure.is_some(), BackendProvider::Azure),
            (self.swift.is_some(), BackendProvider::Swift),
        ]
        .into_iter()
        .filter_map(|(set, provider)| set.then_some(provider))
        .collect();

        match configured.as_slice() {
            [provider] => Ok(*provider),
            [] => Err("no storage backend configured".to_string()),
            many => Err(format!(
                "exactly one storage backend must be configured, found {}",
                many.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    /// Repository location passed to the backup task, e.g. `s3:bucket/prefix`.
    pub fn location(&self) -> Option<String> {
        let join = |root: &str, prefix: &Option<String>| match prefix {
            Some(p) if !p.is_empty() => format!("{}/{}", root, p.trim_matches('/')),
            _ => root.to_string(),
        };
        match self.provider().ok()? {
            BackendProvider::Local => {
                let local = self.local.as_ref()?;
                Some(format!("local:{}", join(&local.mount_path, &local.sub_path)))
            }
            BackendProvider::S3 => {
                let s3 = self.s3.as_ref()?;
                Some(format!("s3:{}", join(&s3.bucket, &s3.prefix)))
            }
            BackendProvider::Gcs => {
                let gcs = self.gcs.as_ref()?;
                Some(format!("gs:{}", join(&gcs.bucket, &gcs.prefix)))
            }
            BackendProvider::Azure => {
                let azure = self.azure.as_ref()?;
                Some(format!("azure:{}", join(&azure.container, &azure.prefix)))
            }
            BackendProvider::Swift => {
                let swift = self.swift.as_ref()?;
                Some(format!("swift:{}", join(&swift.container, &swift.prefix)))
            }
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False, or Unknown
    pub status: String,

    pub reason: String,

    pub message: String,

    /// RFC 3339 time of the last status change
    pub last_transition_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
