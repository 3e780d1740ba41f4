//! Snapshot reconciler
//!
//! Drives a Snapshot from `Pending` through a backup Job to `Succeeded` or
//! `Failed`, and removes the remote payload with a delete Job before letting
//! a deleted snapshot go.

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{info, warn};

use crate::controller::context::Context;
use crate::controller::events::{actions, reasons};
use crate::controller::finalizer::{has_finalizer, is_deleting, remove_finalizer};
use crate::controller::queue::ObjectKey;
use crate::controller::status::write_status;
use crate::controller::validation::validate_snapshot;
use crate::controller::worker::Action;
use crate::controller::{Error, Result};
use crate::crd::{MySQL, Snapshot, SnapshotPhase, SnapshotStatus, StorageType};
use crate::resources::FINALIZER;
use crate::resources::job::{
    JobOutcome, backup_job_name, delete_job_name, generate_backup_job, generate_delete_job,
    job_outcome, scratch_storage, snapshot_labels,
};

#[tracing::instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile_snapshot(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let ns = key.namespace.as_str();
    let Some(snapshot) = ctx.repos.snapshots.get(ns, &key.name).await? else {
        return Ok(Action::await_change());
    };

    if is_deleting(&snapshot) {
        return finalize(&snapshot, ctx).await;
    }

    match snapshot.phase() {
        Some(SnapshotPhase::Succeeded | SnapshotPhase::Failed) => Ok(Action::await_change()),
        Some(SnapshotPhase::Running) => observe_backup(&snapshot, ctx).await,
        None | Some(SnapshotPhase::Pending) => start_backup(&snapshot, ctx).await,
    }
}

/// Database the snapshot backs up, or why it can't be taken
async fn check_source(snapshot: &Snapshot, ctx: &Context) -> Result<std::result::Result<MySQL, String>> {
    if let Err(e) = validate_snapshot(snapshot) {
        return Ok(Err(e.to_string()));
    }
    let ns = snapshot.namespace().unwrap_or_default();
    let db_name = &snapshot.spec.database_name;
    let Some(mysql) = ctx.repos.mysqls.get(&ns, db_name).await? else {
        return Ok(Err(format!("database {db_name} not found")));
    };
    let (storage_type, claim) =
        scratch_storage(snapshot, mysql.spec.storage_type, mysql.spec.storage.as_ref());
    if storage_type == StorageType::Durable && claim.is_none() {
        return Ok(Err(
            "durable job storage requires podVolumeClaimSpec on the snapshot or the database"
                .to_string(),
        ));
    }
    Ok(Ok(mysql))
}

async fn start_backup(snapshot: &Snapshot, ctx: &Context) -> Result<Action> {
    let ns = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();

    let mysql = match check_source(snapshot, ctx).await? {
        Ok(mysql) => mysql,
        Err(reason) => {
            warn!(namespace = %ns, name = %name, %reason, "Snapshot rejected");
            set_phase(snapshot, SnapshotPhase::Failed, Some(reason.clone()), ctx).await?;
            ctx.publish(
                snapshot,
                EventType::Warning,
                reasons::SNAPSHOT_FAILED,
                actions::BACKUP,
                Some(reason),
            )
            .await;
            return Ok(Action::await_change());
        }
    };

    let snapshot = adopt(snapshot, ctx).await?;

    let recorded = SnapshotStatus {
        phase: Some(SnapshotPhase::Pending),
        database_secret_name: Some(mysql.secret_name()),
        ..snapshot.status.clone().unwrap_or_default()
    };
    write_status(
        ctx.repos.snapshots.as_ref(),
        &ns,
        &name,
        snapshot.status.as_ref(),
        &recorded,
    )
    .await?;

    let job = generate_backup_job(&snapshot, &mysql, &ctx.config.backup_task_image)?;
    match ctx.repos.jobs.create(&ns, &job).await {
        Ok(_) => info!(namespace = %ns, name = %name, "Started backup job"),
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e),
    }

    let running = SnapshotStatus {
        phase: Some(SnapshotPhase::Running),
        start_time: Some(Utc::now().to_rfc3339()),
        ..recorded.clone()
    };
    write_status(
        ctx.repos.snapshots.as_ref(),
        &ns,
        &name,
        Some(&recorded),
        &running,
    )
    .await?;
    ctx.publish(
        &snapshot,
        EventType::Normal,
        reasons::SNAPSHOT_STARTED,
        actions::BACKUP,
        Some(format!("backing up database {}", snapshot.spec.database_name)),
    )
    .await;
    Ok(Action::requeue(ctx.config.short_requeue))
}

/// Add the finalizer and per-database labels in one write
async fn adopt(snapshot: &Snapshot, ctx: &Context) -> Result<Snapshot> {
    let labels = snapshot_labels(&snapshot.spec.database_name);
    let labelled = labels
        .iter()
        .all(|(k, v)| snapshot.labels().get(k) == Some(v));
    if labelled && has_finalizer(snapshot) {
        return Ok(snapshot.clone());
    }

    let mut updated = snapshot.clone();
    updated.labels_mut().extend(labels);
    if !has_finalizer(&updated) {
        updated.finalizers_mut().push(FINALIZER.to_string());
    }
    let ns = snapshot.namespace().unwrap_or_default();
    ctx.repos.snapshots.replace(&ns, &updated).await
}

async fn observe_backup(snapshot: &Snapshot, ctx: &Context) -> Result<Action> {
    let ns = snapshot.namespace().unwrap_or_default();
    let job_name = backup_job_name(&snapshot.name_any());
    let Some(job) = ctx.repos.jobs.get(&ns, &job_name).await? else {
        // The job vanished before reporting; start over.
        set_phase(snapshot, SnapshotPhase::Pending, None, ctx).await?;
        return Ok(Action::requeue(std::time::Duration::ZERO));
    };

    match job_outcome(&job) {
        JobOutcome::Running => Ok(Action::requeue(ctx.config.short_requeue)),
        JobOutcome::Succeeded => {
            set_phase(snapshot, SnapshotPhase::Succeeded, None, ctx).await?;
            info!(namespace = %ns, name = %snapshot.name_any(), "Snapshot succeeded");
            ctx.publish(
                snapshot,
                EventType::Normal,
                reasons::SNAPSHOT_SUCCEEDED,
                actions::BACKUP,
                None,
            )
            .await;
            Ok(Action::await_change())
        }
        JobOutcome::Failed(message) => {
            set_phase(snapshot, SnapshotPhase::Failed, Some(message.clone()), ctx).await?;
            warn!(namespace = %ns, name = %snapshot.name_any(), %message, "Snapshot failed");
            ctx.publish(
                snapshot,
                EventType::Warning,
                reasons::SNAPSHOT_FAILED,
                actions::BACKUP,
                Some(message),
            )
            .await;
            Ok(Action::await_change())
        }
    }
}

async fn set_phase(
    snapshot: &Snapshot,
    phase: SnapshotPhase,
    reason: Option<String>,
    ctx: &Context,
) -> Result<bool> {
    let current = snapshot.status.clone().unwrap_or_default();
    let finished = matches!(phase, SnapshotPhase::Succeeded | SnapshotPhase::Failed);
    let desired = SnapshotStatus {
        phase: Some(phase),
        completion_time: if finished {
            current
                .completion_time
                .clone()
                .or_else(|| Some(Utc::now().to_rfc3339()))
        } else {
            None
        },
        reason,
        ..current
    };
    let ns = snapshot.namespace().unwrap_or_default();
    write_status(
        ctx.repos.snapshots.as_ref(),
        &ns,
        &snapshot.name_any(),
        snapshot.status.as_ref(),
        &desired,
    )
    .await
}

/// Remove whatever the backup wrote, then the finalizer
///
/// A backup still uploading is waited on first. Any snapshot whose backup job
/// ran, or that got as far as `Running`, may have left data in the bucket and
/// gets a delete job regardless of how it ended.
async fn finalize(snapshot: &Snapshot, ctx: &Context) -> Result<Action> {
    if !has_finalizer(snapshot) {
        return Ok(Action::await_change());
    }
    let ns = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();

    let backup_job = ctx.repos.jobs.get(&ns, &backup_job_name(&name)).await?;
    if backup_job
        .as_ref()
        .is_some_and(|job| job_outcome(job) == JobOutcome::Running)
    {
        info!(namespace = %ns, name = %name, "Waiting for backup job before removing snapshot");
        return Ok(Action::requeue(ctx.config.short_requeue));
    }

    let may_have_payload = backup_job.is_some()
        || matches!(
            snapshot.phase(),
            Some(SnapshotPhase::Running | SnapshotPhase::Succeeded)
        );
    if may_have_payload {
        let job_name = delete_job_name(&name);
        let Some(job) = ctx.repos.jobs.get(&ns, &job_name).await? else {
            let job = generate_delete_job(snapshot, &ctx.config.backup_task_image);
            match ctx.repos.jobs.create(&ns, &job).await {
                Ok(_) => info!(namespace = %ns, name = %name, "Started snapshot delete job"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
            return Ok(Action::requeue(ctx.config.short_requeue));
        };
        match job_outcome(&job) {
            JobOutcome::Running => return Ok(Action::requeue(ctx.config.short_requeue)),
            JobOutcome::Failed(message) => {
                ctx.repos.jobs.delete(&ns, &job_name).await?;
                return Err(Error::TransientError(format!(
                    "delete job for snapshot {name} failed: {message}"
                )));
            }
            JobOutcome::Succeeded => {}
        }
    }

    remove_finalizer(ctx.repos.snapshots.as_ref(), &ns, snapshot).await?;
    info!(namespace = %ns, name = %name, "Snapshot removed");
    Ok(Action::await_change())
}
