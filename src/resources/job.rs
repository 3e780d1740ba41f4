//! Jobs running the external backup task image
//!
//! The operator never moves data itself. Backups, restores and remote payload
//! deletion are Jobs whose outcome the snapshot and init controllers observe.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource,
    EphemeralVolumeSource, HostPathVolumeSource, PersistentVolumeClaimTemplate,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, SecretEnvSource,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::{Error, Result};
use crate::crd::{MySQL, Snapshot, StorageSpec, StorageType};
use crate::resources::common::{KIND_MYSQL, owner_reference, standard_labels};
use crate::resources::secret::{KEY_PASSWORD, KEY_USERNAME};
use crate::resources::service::MYSQL_PORT;
use crate::resources::statefulset::{claim_spec, container_resources, user_env};

pub const LABEL_SNAPSHOT: &str = "kubedb.com/snapshot";
pub const LABEL_JOB_TYPE: &str = "kubedb.com/job-type";

const SCRATCH_VOLUME: &str = "scratch";
const SCRATCH_DIR: &str = "/var/data";
const LOCAL_REPOSITORY_VOLUME: &str = "local-repository";

/// Which operation a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Restore,
    DeleteSnapshot,
}

impl JobKind {
    fn as_str(self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
            JobKind::DeleteSnapshot => "delete-snapshot",
        }
    }
}

pub fn backup_job_name(snapshot: &str) -> String {
    format!("{snapshot}-backup")
}

pub fn restore_job_name(db_name: &str) -> String {
    format!("{db_name}-restore")
}

pub fn delete_job_name(snapshot: &str) -> String {
    format!("{snapshot}-delete")
}

/// Where a job is in its life
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed(String),
}

pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = &job.status else {
        return JobOutcome::Running;
    };
    let conditions = status.conditions.as_deref().unwrap_or_default();
    let is_true = |type_: &str| {
        conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    };
    if status.succeeded.unwrap_or(0) > 0 || is_true("Complete").is_some() {
        return JobOutcome::Succeeded;
    }
    if let Some(failed) = is_true("Failed") {
        return JobOutcome::Failed(
            failed
                .message
                .clone()
                .unwrap_or_else(|| "job failed".to_string()),
        );
    }
    JobOutcome::Running
}

/// Storage type and claim the job's scratch volume is built from
///
/// The snapshot's own settings win; the database's storage fills the gaps.
pub fn scratch_storage<'a>(
    snapshot: &'a Snapshot,
    db_storage_type: StorageType,
    db_storage: Option<&'a StorageSpec>,
) -> (StorageType, Option<&'a StorageSpec>) {
    let storage_type = snapshot.spec.storage_type.unwrap_or(db_storage_type);
    let claim = snapshot.spec.pod_volume_claim_spec.as_ref().or(db_storage);
    (storage_type, claim)
}

fn scratch_volume(storage_type: StorageType, claim: Option<&StorageSpec>) -> Result<Volume> {
    match (storage_type, claim) {
        (StorageType::Ephemeral, claim) => Ok(Volume {
            name: SCRATCH_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: claim.map(|c| Quantity(c.size.clone())),
                ..Default::default()
            }),
            ..Default::default()
        }),
        (StorageType::Durable, Some(claim)) => Ok(Volume {
            name: SCRATCH_VOLUME.to_string(),
            ephemeral: Some(EphemeralVolumeSource {
                volume_claim_template: Some(PersistentVolumeClaimTemplate {
                    metadata: None,
                    spec: claim_spec(claim),
                }),
            }),
            ..Default::default()
        }),
        (StorageType::Durable, None) => Err(Error::ValidationError(
            "durable job storage requires a volume claim spec".to_string(),
        )),
    }
}

fn local_repository(snapshot: &Snapshot) -> Option<(Volume, VolumeMount)> {
    let local = snapshot.spec.backend.local.as_ref()?;
    let mut volume = Volume {
        name: LOCAL_REPOSITORY_VOLUME.to_string(),
        ..Default::default()
    };
    if let Some(claim) = &local.claim_name {
        volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.clone(),
            ..Default::default()
        });
    } else if let Some(path) = &local.host_path {
        volume.host_path = Some(HostPathVolumeSource {
            path: path.clone(),
            ..Default::default()
        });
    } else {
        volume.empty_dir = Some(EmptyDirVolumeSource::default());
    }
    let mount = VolumeMount {
        name: LOCAL_REPOSITORY_VOLUME.to_string(),
        mount_path: local.mount_path.clone(),
        sub_path: local.sub_path.clone(),
        ..Default::default()
    };
    Some((volume, mount))
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

struct JobParams<'a> {
    kind: JobKind,
    name: String,
    namespace: Option<String>,
    db_name: &'a str,
    snapshot: &'a Snapshot,
    db_secret: Option<&'a str>,
    scratch: Volume,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    task_image: &'a str,
}

fn build_job(params: JobParams<'_>) -> Job {
    let snapshot_name = params.snapshot.name_any();
    let mut labels = standard_labels(KIND_MYSQL, params.db_name);
    labels.insert(LABEL_SNAPSHOT.to_string(), snapshot_name.clone());
    labels.insert(LABEL_JOB_TYPE.to_string(), params.kind.as_str().to_string());

    let mut env = vec![
        EnvVar {
            name: "DB_HOST".to_string(),
            value: Some(params.db_name.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "DB_PORT".to_string(),
            value: Some(MYSQL_PORT.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "REPOSITORY".to_string(),
            value: params.snapshot.spec.backend.location(),
            ..Default::default()
        },
    ];
    if let Some(secret) = params.db_secret {
        env.push(secret_env("DB_USER", secret, KEY_USERNAME));
        env.push(secret_env("DB_PASSWORD", secret, KEY_PASSWORD));
    }
    let template = params.snapshot.spec.pod_template.clone().unwrap_or_default();
    env.extend(user_env(&template.env));

    let env_from = params
        .snapshot
        .spec
        .backend
        .storage_secret_name
        .as_ref()
        .map(|secret| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: secret.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }]
        });

    let mut volumes = vec![params.scratch];
    let mut mounts = vec![VolumeMount {
        name: SCRATCH_VOLUME.to_string(),
        mount_path: SCRATCH_DIR.to_string(),
        ..Default::default()
    }];
    if let Some((volume, mount)) = local_repository(params.snapshot) {
        volumes.push(volume);
        mounts.push(mount);
    }

    let container = Container {
        name: params.kind.as_str().to_string(),
        image: Some(params.task_image.to_string()),
        args: Some(vec![
            params.kind.as_str().to_string(),
            format!("--snapshot={snapshot_name}"),
            format!("--database={}", params.db_name),
            format!("--scratch-dir={SCRATCH_DIR}"),
        ]),
        env: Some(env),
        env_from,
        volume_mounts: Some(mounts),
        resources: container_resources(template.resources.as_ref()),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(params.name),
            namespace: params.namespace,
            labels: Some(labels.clone()),
            owner_references: Some(vec![params.owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: (!template.annotations.is_empty())
                        .then_some(template.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: template.service_account_name.clone(),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the Job taking `snapshot` of `mysql`
pub fn generate_backup_job(snapshot: &Snapshot, mysql: &MySQL, task_image: &str) -> Result<Job> {
    let (storage_type, claim) =
        scratch_storage(snapshot, mysql.spec.storage_type, mysql.spec.storage.as_ref());
    let secret = mysql.secret_name();
    Ok(build_job(JobParams {
        kind: JobKind::Backup,
        name: backup_job_name(&snapshot.name_any()),
        namespace: snapshot.namespace(),
        db_name: &mysql.name_any(),
        snapshot,
        db_secret: Some(&secret),
        scratch: scratch_volume(storage_type, claim)?,
        owner: owner_reference(snapshot),
        task_image,
    }))
}

/// Generate the Job restoring `snapshot` into `mysql`
pub fn generate_restore_job(mysql: &MySQL, snapshot: &Snapshot, task_image: &str) -> Result<Job> {
    let (storage_type, claim) =
        scratch_storage(snapshot, mysql.spec.storage_type, mysql.spec.storage.as_ref());
    let secret = mysql.secret_name();
    Ok(build_job(JobParams {
        kind: JobKind::Restore,
        name: restore_job_name(&mysql.name_any()),
        namespace: mysql.namespace(),
        db_name: &mysql.name_any(),
        snapshot,
        db_secret: Some(&secret),
        scratch: scratch_volume(storage_type, claim)?,
        owner: owner_reference(mysql),
        task_image,
    }))
}

/// Generate the Job removing the remote payload of `snapshot`
pub fn generate_delete_job(snapshot: &Snapshot, task_image: &str) -> Job {
    build_job(JobParams {
        kind: JobKind::DeleteSnapshot,
        name: delete_job_name(&snapshot.name_any()),
        namespace: snapshot.namespace(),
        db_name: &snapshot.spec.database_name,
        snapshot,
        db_secret: None,
        scratch: Volume {
            name: SCRATCH_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        owner: owner_reference(snapshot),
        task_image,
    })
}

/// Labels written onto snapshots so they can be listed per database
pub fn snapshot_labels(db_name: &str) -> BTreeMap<String, String> {
    standard_labels(KIND_MYSQL, db_name)
}
