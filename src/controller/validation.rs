//! Spec validation shared by the reconcilers and the admission webhook
//!
//! The webhook rejects bad objects up front; the reconcilers run the same
//! checks so an object that slipped past admission fails before any child
//! object is created.

use crate::controller::error::{Error, Result};
use crate::controller::scheduler::Cadence;
use crate::crd::{
    BackupScheduleSpec, DormantDatabase, EnvVar, InitSpec, MySQL, ProxySQL, Snapshot, StorageSpec,
    StorageType, TerminationPolicy,
};

pub const MIN_REPLICAS: i32 = 1;
pub const MAX_REPLICAS: i32 = 100;

/// Group replication supports between 3 and 9 members
pub const GROUP_MIN_REPLICAS: i32 = 3;
pub const GROUP_MAX_REPLICAS: i32 = 9;

/// Environment variables the operator owns; setting them in the pod template
/// would fight the generated credentials.
pub const FORBIDDEN_ENV: &[&str] = &[
    "MYSQL_ROOT_PASSWORD",
    "MYSQL_ALLOW_EMPTY_PASSWORD",
    "MYSQL_RANDOM_ROOT_PASSWORD",
    "MYSQL_ONETIME_PASSWORD",
];

const SIZE_SUFFIXES: &[&str] = &["Ki", "Mi", "Gi", "Ti", "Pi", "k", "M", "G", "T", "P"];

fn invalid(message: impl Into<String>) -> Error {
    Error::ValidationError(message.into())
}

/// Validate a MySQL spec
pub fn validate_mysql(mysql: &MySQL) -> Result<()> {
    let spec = &mysql.spec;
    if spec.version.trim().is_empty() {
        return Err(invalid("spec.version is required"));
    }
    validate_replicas(spec.replicas)?;
    if mysql.is_group_replication() {
        if !(GROUP_MIN_REPLICAS..=GROUP_MAX_REPLICAS).contains(&spec.replicas) {
            return Err(invalid(format!(
                "group replication needs between {GROUP_MIN_REPLICAS} and {GROUP_MAX_REPLICAS} replicas, got {}",
                spec.replicas
            )));
        }
        let group_name = spec
            .topology
            .as_ref()
            .and_then(|t| t.group.as_ref())
            .map(|g| g.name.as_str());
        if group_name.is_none_or(|name| name.trim().is_empty()) {
            return Err(invalid("spec.topology.group.name is required for group replication"));
        }
    } else if spec.replicas != 1 {
        return Err(invalid(format!(
            "standalone MySQL runs exactly 1 replica, got {}",
            spec.replicas
        )));
    }

    validate_storage(spec.storage_type, spec.storage.as_ref())?;
    validate_termination(spec.storage_type, spec.termination_policy)?;
    if let Some(init) = &spec.init {
        validate_init(init)?;
    }
    validate_env(&spec.pod_template.env)?;
    if let Some(schedule) = &spec.backup_schedule {
        validate_backup_schedule(schedule, spec.storage_type, spec.storage.as_ref())?;
    }
    Ok(())
}

fn validate_replicas(replicas: i32) -> Result<()> {
    if replicas < MIN_REPLICAS {
        return Err(invalid(format!(
            "replica count {replicas} is below minimum {MIN_REPLICAS}"
        )));
    }
    if replicas > MAX_REPLICAS {
        return Err(invalid(format!(
            "replica count {replicas} exceeds maximum {MAX_REPLICAS}"
        )));
    }
    Ok(())
}

/// Durable storage needs a claim spec with a well-formed size
pub fn validate_storage(storage_type: StorageType, storage: Option<&StorageSpec>) -> Result<()> {
    match (storage_type, storage) {
        (StorageType::Durable, None) => Err(invalid("spec.storage is required for Durable storage")),
        (_, Some(storage)) => validate_storage_size(&storage.size),
        (StorageType::Ephemeral, None) => Ok(()),
    }
}

/// Validate a Kubernetes quantity such as `1Gi` or `500M`
pub fn validate_storage_size(size: &str) -> Result<()> {
    let digits = SIZE_SUFFIXES
        .iter()
        .find_map(|suffix| size.strip_suffix(suffix))
        .unwrap_or(size);
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => Ok(()),
        _ => Err(invalid(format!("invalid storage size {size:?}"))),
    }
}

/// Pausing keeps data for a later resume, which ephemeral storage can't do
pub fn validate_termination(storage_type: StorageType, policy: TerminationPolicy) -> Result<()> {
    if storage_type == StorageType::Ephemeral && policy == TerminationPolicy::Pause {
        return Err(invalid(
            "terminationPolicy Pause is not supported for Ephemeral storage",
        ));
    }
    Ok(())
}

/// Exactly one init mode may be set
pub fn validate_init(init: &InitSpec) -> Result<()> {
    let modes = [
        init.script_source.is_some(),
        init.snapshot_source.is_some(),
        init.stash_restore_session.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    match modes {
        1 => {}
        0 => return Err(invalid("spec.init must set one of scriptSource, snapshotSource or stashRestoreSession")),
        _ => return Err(invalid("spec.init may set only one of scriptSource, snapshotSource or stashRestoreSession")),
    }

    if let Some(script) = &init.script_source {
        if script.config_map.is_none() == script.git_repo.is_none() {
            return Err(invalid(
                "spec.init.scriptSource needs exactly one of configMap or gitRepo",
            ));
        }
    }
    if let Some(source) = &init.snapshot_source {
        if source.name.trim().is_empty() {
            return Err(invalid("spec.init.snapshotSource.name is required"));
        }
    }
    if let Some(session) = &init.stash_restore_session {
        if session.name.trim().is_empty() {
            return Err(invalid("spec.init.stashRestoreSession.name is required"));
        }
    }
    Ok(())
}

pub fn validate_env(vars: &[EnvVar]) -> Result<()> {
    if let Some(var) = vars.iter().find(|v| FORBIDDEN_ENV.contains(&v.name.as_str())) {
        return Err(invalid(format!(
            "environment variable {} is managed by the operator and cannot be set",
            var.name
        )));
    }
    Ok(())
}

pub fn validate_backup_schedule(
    schedule: &BackupScheduleSpec,
    db_storage_type: StorageType,
    db_storage: Option<&StorageSpec>,
) -> Result<()> {
    Cadence::parse(&schedule.cron_expression)?;
    schedule
        .backend
        .provider()
        .map_err(|e| invalid(format!("spec.backupSchedule: {e}")))?;
    let storage_type = schedule.storage_type.unwrap_or(db_storage_type);
    let claim = schedule.pod_volume_claim_spec.as_ref().or(db_storage);
    if storage_type == StorageType::Durable && claim.is_none() {
        return Err(invalid(
            "spec.backupSchedule needs podVolumeClaimSpec for Durable job storage",
        ));
    }
    Ok(())
}

/// Reject changes to fields a running database can't absorb
pub fn validate_mysql_update(old: &MySQL, new: &MySQL) -> Result<()> {
    let (old, new) = (&old.spec, &new.spec);
    if old.storage_type != new.storage_type {
        return Err(invalid("spec.storageType cannot be changed"));
    }
    if old.storage != new.storage {
        return Err(invalid("spec.storage cannot be changed"));
    }
    if old.database_secret.is_some() && old.database_secret != new.database_secret {
        return Err(invalid("spec.databaseSecret cannot be changed"));
    }
    if old.init != new.init {
        return Err(invalid("spec.init cannot be changed"));
    }
    if old.topology != new.topology {
        return Err(invalid("spec.topology cannot be changed"));
    }
    Ok(())
}

pub fn validate_proxysql(proxysql: &ProxySQL) -> Result<()> {
    let spec = &proxysql.spec;
    if spec.version.trim().is_empty() {
        return Err(invalid("spec.version is required"));
    }
    validate_replicas(spec.replicas)?;
    if spec.backend.ref_.name.trim().is_empty() {
        return Err(invalid("spec.backend.ref.name is required"));
    }
    validate_storage(spec.storage_type, spec.storage.as_ref())?;
    validate_env(&spec.pod_template.env)
}

/// Backend and job volume rules; database existence is checked by the caller
pub fn validate_snapshot(snapshot: &Snapshot) -> Result<()> {
    if snapshot.spec.database_name.trim().is_empty() {
        return Err(invalid("spec.databaseName is required"));
    }
    snapshot
        .spec
        .backend
        .provider()
        .map_err(|e| invalid(format!("snapshot backend: {e}")))?;
    if let Some(claim) = &snapshot.spec.pod_volume_claim_spec {
        validate_storage_size(&claim.size)?;
    }
    Ok(())
}

pub fn validate_snapshot_update(old: &Snapshot, new: &Snapshot) -> Result<()> {
    if old.spec != new.spec {
        return Err(invalid("snapshot spec is immutable"));
    }
    Ok(())
}

pub fn validate_dormant_update(old: &DormantDatabase, new: &DormantDatabase) -> Result<()> {
    if old.spec.origin != new.spec.origin {
        return Err(invalid("spec.origin cannot be changed"));
    }
    if old.spec.wipe_out && !new.spec.wipe_out {
        return Err(invalid("spec.wipeOut cannot be unset once requested"));
    }
    Ok(())
}
