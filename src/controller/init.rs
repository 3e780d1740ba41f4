//! Initialization coordinator
//!
//! Decides whether a database's init source has been applied. Scripts run in
//! the MySQL entrypoint and are done once the workload is ready. Snapshot and
//! restore-session sources are tracked through a Job or a RestoreSession and,
//! once applied, recorded with the `kubedb.com/initialized` annotation so they
//! never run again.

use kube::ResourceExt;
use tracing::info;

use crate::controller::context::Context;
use crate::controller::dormant::restores_initialized_data;
use crate::controller::validation::validate_init;
use crate::controller::{Error, Result};
use crate::crd::{
    DormantDatabase, MySQL, RestorePhase, Snapshot, SnapshotPhase, SnapshotSourceSpec,
};
use crate::resources::common::ANNOTATION_INITIALIZED;
use crate::resources::job::{JobOutcome, generate_restore_job, job_outcome, restore_job_name};

/// Where a database's initialization stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitProgress {
    /// No init source, or it was applied before
    NotRequired,
    /// Applied; `stamp_marker` asks the caller to record the annotation
    Complete { stamp_marker: bool },
    /// Still in progress, with a human-readable reason
    Pending(String),
    /// Failed permanently
    Failed(String),
}

impl InitProgress {
    pub fn is_pending(&self) -> bool {
        matches!(self, InitProgress::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, InitProgress::Failed(_))
    }
}

pub fn is_initialized(mysql: &MySQL) -> bool {
    mysql.annotations().contains_key(ANNOTATION_INITIALIZED)
}

/// Check the init source of `mysql`, starting the restore Job when due
pub async fn check_init(mysql: &MySQL, workload_ready: bool, ctx: &Context) -> Result<InitProgress> {
    let Some(init) = &mysql.spec.init else {
        return Ok(InitProgress::NotRequired);
    };
    if is_initialized(mysql) {
        return Ok(InitProgress::NotRequired);
    }
    validate_init(init)?;

    if init.script_source.is_some() {
        return Ok(if workload_ready {
            InitProgress::Complete {
                stamp_marker: false,
            }
        } else {
            InitProgress::Pending("waiting for the workload to run init scripts".to_string())
        });
    }

    if let Some(source) = &init.snapshot_source {
        return check_snapshot_source(mysql, source, workload_ready, ctx).await;
    }

    if let Some(session) = &init.stash_restore_session {
        let ns = mysql.namespace().unwrap_or_default();
        let Some(restore) = ctx.repos.restore_sessions.get(&ns, &session.name).await? else {
            return Ok(InitProgress::Pending(format!(
                "waiting for RestoreSession {}",
                session.name
            )));
        };
        return Ok(match restore.phase() {
            Some(RestorePhase::Succeeded) => InitProgress::Complete { stamp_marker: true },
            Some(RestorePhase::Failed) => {
                InitProgress::Failed(format!("RestoreSession {} failed", session.name))
            }
            phase => InitProgress::Pending(format!(
                "RestoreSession {} is {}",
                session.name,
                phase.map_or("Pending".to_string(), |p| format!("{p:?}"))
            )),
        });
    }

    Ok(InitProgress::NotRequired)
}

/// Reject a snapshot init source whose credentials can't open the data
///
/// Runs before any child object exists, so a mismatch never leaves a
/// half-created workload behind. Sources that were already applied are not
/// looked at again, nor are those of a database resuming initialized data.
pub async fn verify_init_source(
    mysql: &MySQL,
    dormant: Option<&DormantDatabase>,
    ctx: &Context,
) -> Result<()> {
    if is_initialized(mysql) || dormant.is_some_and(restores_initialized_data) {
        return Ok(());
    }
    let Some(source) = mysql
        .spec
        .init
        .as_ref()
        .and_then(|i| i.snapshot_source.as_ref())
    else {
        return Ok(());
    };
    let db_ns = mysql.namespace().unwrap_or_default();
    let snapshot_ns = source.namespace.clone().unwrap_or(db_ns);
    let Some(snapshot) = ctx.repos.snapshots.get(&snapshot_ns, &source.name).await? else {
        return Err(Error::ValidationError(format!(
            "snapshot {snapshot_ns}/{} not found",
            source.name
        )));
    };
    check_snapshot_credentials(mysql, &snapshot, &source.name)
}

fn check_snapshot_credentials(mysql: &MySQL, snapshot: &Snapshot, source_name: &str) -> Result<()> {
    let Some(secret) = &mysql.spec.database_secret else {
        return Err(Error::ValidationError(
            "spec.databaseSecret must be set when initializing from a snapshot".to_string(),
        ));
    };
    // Recorded once the backup starts; until then there is nothing to compare.
    let Some(recorded) = snapshot
        .status
        .as_ref()
        .and_then(|s| s.database_secret_name.as_deref())
    else {
        return Ok(());
    };
    if recorded != secret.secret_name {
        return Err(Error::ValidationError(format!(
            "spec.databaseSecret {} does not match the secret {recorded} recorded by snapshot {source_name}",
            secret.secret_name
        )));
    }
    Ok(())
}

async fn check_snapshot_source(
    mysql: &MySQL,
    source: &SnapshotSourceSpec,
    workload_ready: bool,
    ctx: &Context,
) -> Result<InitProgress> {
    let db_ns = mysql.namespace().unwrap_or_default();
    let snapshot_ns = source.namespace.clone().unwrap_or_else(|| db_ns.clone());

    let Some(snapshot) = ctx.repos.snapshots.get(&snapshot_ns, &source.name).await? else {
        return Err(Error::ValidationError(format!(
            "snapshot {snapshot_ns}/{} not found",
            source.name
        )));
    };
    match snapshot.phase() {
        Some(SnapshotPhase::Succeeded) => {}
        Some(SnapshotPhase::Failed) => {
            return Err(Error::ValidationError(format!(
                "snapshot {} failed and cannot be restored",
                source.name
            )));
        }
        _ => {
            return Ok(InitProgress::Pending(format!(
                "waiting for snapshot {} to succeed",
                source.name
            )));
        }
    }

    check_snapshot_credentials(mysql, &snapshot, &source.name)?;

    if !workload_ready {
        return Ok(InitProgress::Pending(
            "waiting for the workload before restoring".to_string(),
        ));
    }

    let job_name = restore_job_name(&mysql.name_any());
    let Some(job) = ctx.repos.jobs.get(&db_ns, &job_name).await? else {
        let job = generate_restore_job(mysql, &snapshot, &ctx.config.backup_task_image)?;
        match ctx.repos.jobs.create(&db_ns, &job).await {
            Ok(_) => info!(namespace = %db_ns, job = %job_name, "Started restore job"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        return Ok(InitProgress::Pending(format!("restore job {job_name} started")));
    };

    Ok(match job_outcome(&job) {
        JobOutcome::Succeeded => InitProgress::Complete { stamp_marker: true },
        JobOutcome::Failed(message) => {
            InitProgress::Failed(format!("restore job {job_name} failed: {message}"))
        }
        JobOutcome::Running => InitProgress::Pending(format!("restore job {job_name} is running")),
    })
}

/// Record that the init source was applied; returns the stored object
pub async fn stamp_initialized(mysql: &MySQL, ctx: &Context) -> Result<MySQL> {
    if is_initialized(mysql) {
        return Ok(mysql.clone());
    }
    let ns = mysql.namespace().unwrap_or_default();
    let mut updated = mysql.clone();
    updated
        .annotations_mut()
        .insert(ANNOTATION_INITIALIZED.to_string(), "true".to_string());
    let stored = ctx.repos.mysqls.replace(&ns, &updated).await?;
    info!(namespace = %ns, name = %mysql.name_any(), "Marked database initialized");
    Ok(stored)
}
