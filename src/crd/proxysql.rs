use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::mysql::DatabasePhase;
use super::shared::{
    Condition, LocalObjectReference, PodTemplateSpec, SecretReference, StorageSpec, StorageType,
};

/// ProxySQL load-balancing tier in front of a MySQL group
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "ProxySQL",
    plural = "proxysqls",
    shortname = "prx",
    namespaced,
    status = "ProxySQLStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxySQLSpec {
    pub version: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub mode: ProxySQLMode,

    pub backend: ProxySQLBackend,

    /// Admin credentials; generated as `<name>-auth` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql_secret: Option<SecretReference>,

    #[serde(default)]
    pub storage_type: StorageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(default)]
    pub pod_template: PodTemplateSpec,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum ProxySQLMode {
    #[default]
    GroupReplication,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySQLBackend {
    /// The MySQL object traffic is routed to
    #[serde(rename = "ref")]
    pub ref_: LocalObjectReference,

    #[serde(default = "default_backend_replicas")]
    pub replicas: i32,
}

fn default_backend_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySQLStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ProxySQL {
    pub fn secret_name(&self) -> String {
        self.spec
            .proxysql_secret
            .as_ref()
            .map(|s| s.secret_name.clone())
            .unwrap_or_else(|| format!("{}-auth", kube::ResourceExt::name_any(self)))
    }
}
