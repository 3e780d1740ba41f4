//! StatefulSet generation for MySQL and ProxySQL workloads

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{self, MySQL, ProxySQL, ScriptSourceSpec, StorageSpec, StorageType};
use crate::resources::common::{
    KIND_MYSQL, KIND_PROXYSQL, database_selector, merged_labels, owner_reference,
};
use crate::resources::secret::{KEY_PASSWORD, KEY_USERNAME};
use crate::resources::service::{
    MYSQL_PORT, PROXYSQL_ADMIN_PORT, PROXYSQL_PORT, governing_service_name,
};

pub const DATA_VOLUME: &str = "data";
pub const DATA_DIR: &str = "/var/lib/mysql";
pub const INIT_SCRIPTS_VOLUME: &str = "init-scripts";
pub const INIT_SCRIPTS_DIR: &str = "/docker-entrypoint-initdb.d";
pub const CUSTOM_CONFIG_VOLUME: &str = "custom-config";
pub const CUSTOM_CONFIG_DIR: &str = "/etc/mysql/conf.d";

const GIT_IMAGE: &str = "alpine/git:2.45.2";

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Convert user env vars onto container env
pub fn user_env(vars: &[crd::EnvVar]) -> Vec<EnvVar> {
    vars.iter().map(|v| env(&v.name, v.value.clone())).collect()
}

/// Convert spec resources onto container resources
pub fn container_resources(spec: Option<&crd::ResourceRequirements>) -> Option<ResourceRequirements> {
    let spec = spec?;
    let list = |list: Option<&crd::ResourceList>| {
        list.map(|l| {
            let mut out = BTreeMap::new();
            if let Some(cpu) = &l.cpu {
                out.insert("cpu".to_string(), Quantity(cpu.clone()));
            }
            if let Some(memory) = &l.memory {
                out.insert("memory".to_string(), Quantity(memory.clone()));
            }
            out
        })
    };
    Some(ResourceRequirements {
        requests: list(spec.requests.as_ref()),
        limits: list(spec.limits.as_ref()),
        ..Default::default()
    })
}

/// Volume claim spec for a storage request
pub fn claim_spec(storage: &StorageSpec) -> PersistentVolumeClaimSpec {
    let access_modes = if storage.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        storage.access_modes.clone()
    };
    PersistentVolumeClaimSpec {
        access_modes: Some(access_modes),
        storage_class_name: storage.storage_class.clone(),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(storage.size.clone()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_claim_template(
    storage: &StorageSpec,
    labels: BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(claim_spec(storage)),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Volumes and init containers that place init scripts under the entrypoint directory
fn script_volume(source: &ScriptSourceSpec) -> (Volume, Option<Container>) {
    if let Some(config_map) = &source.config_map {
        let volume = Volume {
            name: INIT_SCRIPTS_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        return (volume, None);
    }

    let clone = source.git_repo.as_ref().map(|repo| {
        let mut script = format!("git clone {} /scripts/repo", repo.repository);
        if let Some(revision) = &repo.revision {
            script.push_str(&format!(" && git -C /scripts/repo checkout {revision}"));
        }
        let dir = repo.directory.as_deref().unwrap_or(".");
        script.push_str(&format!(
            " && cp -r /scripts/repo/{dir}/. /scripts/ && rm -rf /scripts/repo"
        ));
        Container {
            name: "git-clone".to_string(),
            image: Some(GIT_IMAGE.to_string()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            volume_mounts: Some(vec![VolumeMount {
                name: INIT_SCRIPTS_VOLUME.to_string(),
                mount_path: "/scripts".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    });
    (empty_dir(INIT_SCRIPTS_VOLUME), clone)
}

fn mysql_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                "mysql -h127.0.0.1 -u\"${MYSQL_ROOT_USERNAME}\" -p\"${MYSQL_ROOT_PASSWORD}\" -e 'SELECT 1'"
                    .to_string(),
            ]),
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Generate the MySQL StatefulSet
///
/// Durable storage uses a `data` volume claim template whose PVCs carry the
/// database labels, Ephemeral storage uses an emptyDir. Group replication
/// members get their identity through environment variables.
pub fn generate_mysql_statefulset(mysql: &MySQL, image_registry: &str) -> StatefulSet {
    let name = mysql.name_any();
    let spec = &mysql.spec;
    let pod_labels = merged_labels(KIND_MYSQL, &name, &spec.pod_template.labels);
    let selector = database_selector(KIND_MYSQL, &name);
    let secret = mysql.secret_name();

    let mut env_vars = vec![
        secret_env("MYSQL_ROOT_USERNAME", &secret, KEY_USERNAME),
        secret_env("MYSQL_ROOT_PASSWORD", &secret, KEY_PASSWORD),
    ];
    if let Some(group) = spec.topology.as_ref().and_then(|t| t.group.as_ref()) {
        env_vars.extend([
            env("GROUP_NAME", group.name.clone()),
            env("BASE_SERVER_ID", group.base_server_id.to_string()),
            env("GOV_SVC", governing_service_name(&name)),
            field_env("POD_NAMESPACE", "metadata.namespace"),
            env("DB_NAME", name.clone()),
        ]);
    }
    env_vars.extend(user_env(&spec.pod_template.env));

    let mut volume_mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: DATA_DIR.to_string(),
        ..Default::default()
    }];
    let mut volumes = Vec::new();
    let mut init_containers = Vec::new();

    if let Some(config) = &spec.config_source {
        volumes.push(Volume {
            name: CUSTOM_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: CUSTOM_CONFIG_VOLUME.to_string(),
            mount_path: CUSTOM_CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if let Some(script) = spec.init.as_ref().and_then(|i| i.script_source.as_ref()) {
        let (volume, init) = script_volume(script);
        volumes.push(volume);
        init_containers.extend(init);
        volume_mounts.push(VolumeMount {
            name: INIT_SCRIPTS_VOLUME.to_string(),
            mount_path: INIT_SCRIPTS_DIR.to_string(),
            ..Default::default()
        });
    }

    let claim_templates = match (spec.storage_type, &spec.storage) {
        (StorageType::Durable, Some(storage)) => Some(vec![data_claim_template(
            storage,
            merged_labels(KIND_MYSQL, &name, &BTreeMap::new()),
        )]),
        _ => {
            volumes.push(empty_dir(DATA_VOLUME));
            None
        }
    };

    let container = Container {
        name: "mysql".to_string(),
        image: Some(format!("{image_registry}/mysql:{}", spec.version)),
        ports: Some(vec![ContainerPort {
            name: Some("db".to_string()),
            container_port: MYSQL_PORT,
            ..Default::default()
        }]),
        env: Some(env_vars),
        volume_mounts: Some(volume_mounts),
        resources: container_resources(spec.pod_template.resources.as_ref()),
        readiness_probe: Some(mysql_probe()),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: mysql.namespace(),
            labels: Some(merged_labels(KIND_MYSQL, &name, &BTreeMap::new())),
            owner_references: Some(vec![owner_reference(mysql)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(governing_service_name(&name)),
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!spec.pod_template.annotations.is_empty())
                        .then(|| spec.pod_template.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: spec.pod_template.service_account_name.clone(),
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    termination_grace_period_seconds: Some(30),
                    ..Default::default()
                }),
            },
            volume_claim_templates: claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the ProxySQL StatefulSet routing to `backend_service`
pub fn generate_proxysql_statefulset(
    proxysql: &ProxySQL,
    backend_service: &str,
    image_registry: &str,
) -> StatefulSet {
    let name = proxysql.name_any();
    let spec = &proxysql.spec;
    let pod_labels = merged_labels(KIND_PROXYSQL, &name, &spec.pod_template.labels);
    let secret = proxysql.secret_name();

    let mut env_vars = vec![
        secret_env("PROXYSQL_ADMIN_USER", &secret, KEY_USERNAME),
        secret_env("PROXYSQL_ADMIN_PASSWORD", &secret, KEY_PASSWORD),
        env("MYSQL_SERVICE", backend_service),
        env("MYSQL_REPLICAS", spec.backend.replicas.to_string()),
        env("LOAD_BALANCE_MODE", "GroupReplication"),
    ];
    env_vars.extend(user_env(&spec.pod_template.env));

    let mut volumes = Vec::new();
    let claim_templates = match (spec.storage_type, &spec.storage) {
        (StorageType::Durable, Some(storage)) => Some(vec![data_claim_template(
            storage,
            merged_labels(KIND_PROXYSQL, &name, &BTreeMap::new()),
        )]),
        _ => {
            volumes.push(empty_dir(DATA_VOLUME));
            None
        }
    };

    let container = Container {
        name: "proxysql".to_string(),
        image: Some(format!("{image_registry}/proxysql:{}", spec.version)),
        ports: Some(vec![
            ContainerPort {
                name: Some("mysql".to_string()),
                container_port: PROXYSQL_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("admin".to_string()),
                container_port: PROXYSQL_ADMIN_PORT,
                ..Default::default()
            },
        ]),
        env: Some(env_vars),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: "/var/lib/proxysql".to_string(),
            ..Default::default()
        }]),
        resources: container_resources(spec.pod_template.resources.as_ref()),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: proxysql.namespace(),
            labels: Some(merged_labels(KIND_PROXYSQL, &name, &BTreeMap::new())),
            owner_references: Some(vec![owner_reference(proxysql)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(name.clone()),
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(database_selector(KIND_PROXYSQL, &name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: spec.pod_template.service_account_name.clone(),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ready replicas versus desired, as seen on the live object
pub fn readiness(statefulset: &StatefulSet) -> (i32, i32) {
    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = statefulset
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    (ready, desired)
}
