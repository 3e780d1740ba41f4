use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::mysql::MySQLSpec;

/// Archived record of a paused MySQL database
///
/// Shares the name of the MySQL object it archives. While it exists, creating
/// a MySQL with the same name resumes the archived database.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    pub origin: Origin,

    /// Irreversibly delete PVCs, operator-managed secrets and snapshots
    #[serde(default)]
    pub wipe_out: bool,
}

/// The archived object's identity and full spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub metadata: OriginMeta,
    pub spec: OriginSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OriginMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginSpec {
    pub mysql: MySQLSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DormantPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pausing_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipe_out_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum DormantPhase {
    /// Waiting for the archived workload to disappear
    Pausing,
    /// Storage retained, resumable
    Paused,
    /// A MySQL with the same name is taking over
    Resuming,
    /// Storage removed; terminal
    WipedOut,
}

impl std::fmt::Display for DormantPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DormantPhase::Pausing => write!(f, "Pausing"),
            DormantPhase::Paused => write!(f, "Paused"),
            DormantPhase::Resuming => write!(f, "Resuming"),
            DormantPhase::WipedOut => write!(f, "WipedOut"),
        }
    }
}

impl DormantPhase {
    /// Whether the manager may move a dormant database from `self` to `to`
    pub fn can_transition_to(self, to: DormantPhase) -> bool {
        use DormantPhase::*;
        matches!(
            (self, to),
            (Pausing, Paused)
                | (Paused, Resuming)
                | (Paused, WipedOut)
                | (Resuming, Paused)
                | (Resuming, Pausing)
        )
    }
}

impl DormantDatabase {
    pub fn phase(&self) -> Option<DormantPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}
