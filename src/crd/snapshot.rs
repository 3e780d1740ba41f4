use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{PodTemplateSpec, StorageBackend, StorageSpec, StorageType};

/// A point-in-time backup of a MySQL database
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "Snapshot",
    plural = "snapshots",
    shortname = "snap",
    namespaced,
    status = "SnapshotStatus",
    printcolumn = r#"{"name":"DatabaseName", "type":"string", "jsonPath":".spec.databaseName"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    pub database_name: String,

    #[serde(flatten)]
    pub backend: StorageBackend,

    /// Job scratch volume type; Durable needs a claim spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<StorageType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_volume_claim_spec: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SnapshotPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Credential secret of the source database when the backup was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum SnapshotPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotPhase::Pending => write!(f, "Pending"),
            SnapshotPhase::Running => write!(f, "Running"),
            SnapshotPhase::Succeeded => write!(f, "Succeeded"),
            SnapshotPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl Snapshot {
    pub fn phase(&self) -> Option<SnapshotPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Not yet finished; counts against the one-backup-at-a-time rule
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.phase(),
            None | Some(SnapshotPhase::Pending) | Some(SnapshotPhase::Running)
        )
    }
}
