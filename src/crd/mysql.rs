use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{
    BackupScheduleSpec, Condition, InitSpec, PodTemplateSpec, SecretReference,
    ServiceTemplateSpec, StorageSpec, StorageType, TerminationPolicy,
};

/// MySQL is the Schema for the mysqls API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "MySQL",
    plural = "mysqls",
    shortname = "my",
    namespaced,
    status = "MySQLStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MySQLSpec {
    /// MySQL server version (e.g., "8.0.21", "5.7.25")
    pub version: String,

    /// Number of server instances
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Clustering mode, standalone when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<MySQLTopology>,

    #[serde(default)]
    pub storage_type: StorageType,

    /// Volume claim template; required for Durable storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Root credentials; generated as `<name>-auth` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_secret: Option<SecretReference>,

    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,

    #[serde(default)]
    pub pod_template: PodTemplateSpec,

    /// ConfigMap with custom `my.cnf` fragments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<ServiceTemplateSpec>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MySQLTopology {
    pub mode: MySQLClusterMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupSpec>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MySQLClusterMode {
    GroupReplication,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    /// Group replication UUID
    pub name: String,

    #[serde(default = "default_base_server_id")]
    pub base_server_id: u32,
}

fn default_base_server_id() -> u32 {
    100
}

/// Status of a MySQL database
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MySQLStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable explanation of the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the current phase was entered (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Database lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum DatabasePhase {
    /// Child objects are being created and the workload is starting
    Provisioning,
    /// The workload is up and an init source is being applied
    Initializing,
    /// Ready to serve
    Running,
    /// Re-created from a DormantDatabase
    Resuming,
    /// Being archived into a DormantDatabase
    Pausing,
    /// Archived; recorded just before the object disappears
    Paused,
    /// Storage is being removed before the object disappears
    Terminating,
    /// Needs a spec change to make progress
    Failed,
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePhase::Provisioning => write!(f, "Provisioning"),
            DatabasePhase::Initializing => write!(f, "Initializing"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Resuming => write!(f, "Resuming"),
            DatabasePhase::Pausing => write!(f, "Pausing"),
            DatabasePhase::Paused => write!(f, "Paused"),
            DatabasePhase::Terminating => write!(f, "Terminating"),
            DatabasePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl MySQL {
    /// Current phase, if the reconciler has recorded one
    pub fn phase(&self) -> Option<DatabasePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Name of the credential secret, explicit or generated
    pub fn secret_name(&self) -> String {
        effective_secret_name(&self.spec, &kube::ResourceExt::name_any(self))
    }

    pub fn is_group_replication(&self) -> bool {
        self.spec
            .topology
            .as_ref()
            .is_some_and(|t| t.mode == MySQLClusterMode::GroupReplication)
    }
}

/// Name of the credential secret a spec resolves to for a database called `db_name`
pub fn effective_secret_name(spec: &MySQLSpec, db_name: &str) -> String {
    spec.database_secret
        .as_ref()
        .map(|s| s.secret_name.clone())
        .unwrap_or_else(|| format!("{db_name}-auth"))
}
