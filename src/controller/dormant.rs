//! Dormant-database manager
//!
//! Applies the termination policy when a MySQL object is deleted, archives
//! paused databases into a DormantDatabase, resumes them when a MySQL with the
//! same name reappears and carries out wipe-out.
//!
//! | Policy         | PVCs    | Secrets | Snapshots | Dormant |
//! |----------------|---------|---------|-----------|---------|
//! | DoNotTerminate | -       | -       | -         | -       |
//! | Pause          | kept    | kept    | kept      | created |
//! | Delete         | deleted | kept    | kept      | -       |
//! | WipeOut        | deleted | deleted | deleted   | -       |

use chrono::Utc;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::events::{actions, reasons};
use crate::controller::finalizer::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use crate::controller::queue::ObjectKey;
use crate::controller::reconciler::apply_event;
use crate::controller::state_machine::{DatabaseEvent, TransitionContext};
use crate::controller::status::{StatusManager, write_status};
use crate::controller::worker::Action;
use crate::controller::{Error, Result};
use crate::crd::{
    DatabasePhase, DormantDatabase, DormantDatabaseSpec, DormantDatabaseStatus, DormantPhase,
    MySQL, MySQLSpec, Origin, OriginMeta, OriginSpec, TerminationPolicy, effective_secret_name,
};
use crate::resources::common::{
    ANNOTATION_INITIALIZED, KIND_MYSQL, database_selector, is_operator_managed, standard_labels,
};

/// Apply the termination policy of a MySQL object being deleted
pub async fn handle_deletion(mysql: &MySQL, ctx: &Context) -> Result<Action> {
    let ns = mysql.namespace().unwrap_or_default();
    let name = mysql.name_any();
    ctx.scheduler.remove(&ObjectKey::new(&ns, &name));

    if !has_finalizer(mysql) {
        return Ok(Action::await_change());
    }

    match mysql.spec.termination_policy {
        TerminationPolicy::DoNotTerminate => {
            let reason = "deletion blocked: terminationPolicy is DoNotTerminate";
            let current = mysql.phase().unwrap_or(DatabasePhase::Provisioning);
            let status = StatusManager::new(mysql, ctx.repos.mysqls.as_ref(), &ns);
            if status.set_phase(current, Some(reason)).await? {
                warn!(namespace = %ns, name = %name, "Deletion blocked by termination policy");
                ctx.publish(
                    mysql,
                    EventType::Warning,
                    reasons::DELETION_BLOCKED,
                    actions::DELETE,
                    Some(reason.to_string()),
                )
                .await;
            }
            Ok(Action::await_change())
        }
        TerminationPolicy::Pause => pause(mysql, ctx).await,
        TerminationPolicy::Delete => terminate(mysql, false, ctx).await,
        TerminationPolicy::WipeOut => terminate(mysql, true, ctx).await,
    }
}

/// DormantDatabase archiving `mysql`
pub fn dormant_from(mysql: &MySQL) -> DormantDatabase {
    let name = mysql.name_any();
    let ns = mysql.namespace().unwrap_or_default();
    DormantDatabase {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.clone()),
            labels: Some(standard_labels(KIND_MYSQL, &name)),
            ..Default::default()
        },
        spec: DormantDatabaseSpec {
            origin: Origin {
                metadata: OriginMeta {
                    name,
                    namespace: ns,
                    labels: mysql.labels().clone(),
                    annotations: mysql.annotations().clone(),
                },
                spec: OriginSpec {
                    mysql: mysql.spec.clone(),
                },
            },
            wipe_out: false,
        },
        status: None,
    }
}

async fn pause(mysql: &MySQL, ctx: &Context) -> Result<Action> {
    let ns = mysql.namespace().unwrap_or_default();
    let name = mysql.name_any();
    let observed = TransitionContext::default();

    apply_event(mysql, DatabaseEvent::PauseRequested, &observed, None, ctx).await?;

    match ctx.repos.dormant_databases.get(&ns, &name).await? {
        None => {
            let created = match ctx.repos.dormant_databases.create(&ns, &dormant_from(mysql)).await {
                Ok(created) => created,
                Err(e) if e.is_already_exists() => return Ok(Action::requeue(ctx.config.short_requeue)),
                Err(e) => return Err(e),
            };
            set_dormant_phase(&created, DormantPhase::Pausing, ctx).await?;
            info!(namespace = %ns, name = %name, "Created dormant database");
        }
        Some(existing) if is_deleting(&existing) => {
            debug!(namespace = %ns, name = %name, "Previous dormant database still terminating");
            return Ok(Action::requeue(ctx.config.short_requeue));
        }
        Some(existing) => match existing.phase() {
            Some(DormantPhase::Resuming) => {
                // The resumed database is archived again before it finished resuming.
                let mut updated = existing.clone();
                updated.spec.origin = dormant_from(mysql).spec.origin;
                let stored = ctx.repos.dormant_databases.replace(&ns, &updated).await?;
                set_dormant_phase(&stored, DormantPhase::Pausing, ctx).await?;
            }
            Some(DormantPhase::WipedOut) => {
                return Ok(Action::requeue(ctx.config.short_requeue));
            }
            _ => {}
        },
    }

    ctx.repos.statefulsets.delete(&ns, &name).await?;

    let Some(current) = ctx.repos.mysqls.get(&ns, &name).await? else {
        return Ok(Action::await_change());
    };
    apply_event(&current, DatabaseEvent::PauseCompleted, &observed, None, ctx).await?;
    let Some(current) = ctx.repos.mysqls.get(&ns, &name).await? else {
        return Ok(Action::await_change());
    };
    remove_finalizer(ctx.repos.mysqls.as_ref(), &ns, &current).await?;

    info!(namespace = %ns, name = %name, "Database paused");
    ctx.publish(
        mysql,
        EventType::Normal,
        reasons::PAUSED,
        actions::PAUSE,
        Some(format!("archived into DormantDatabase {name}")),
    )
    .await;
    Ok(Action::await_change())
}

async fn terminate(mysql: &MySQL, wipe: bool, ctx: &Context) -> Result<Action> {
    let ns = mysql.namespace().unwrap_or_default();
    let name = mysql.name_any();

    if apply_event(
        mysql,
        DatabaseEvent::TerminationRequested,
        &TransitionContext::default(),
        None,
        ctx,
    )
    .await?
        == DatabasePhase::Terminating
    {
        let (reason, action) = if wipe {
            (reasons::WIPING_OUT, actions::WIPE_OUT)
        } else {
            (reasons::DELETING, actions::DELETE)
        };
        ctx.publish(mysql, EventType::Normal, reason, action, None).await;
    }

    if !purge_storage(&ns, &name, &mysql.spec, wipe, ctx).await? {
        return Ok(Action::requeue(ctx.config.short_requeue));
    }

    let Some(current) = ctx.repos.mysqls.get(&ns, &name).await? else {
        return Ok(Action::await_change());
    };
    remove_finalizer(ctx.repos.mysqls.as_ref(), &ns, &current).await?;
    info!(namespace = %ns, name = %name, wipe, "Database storage removed");
    Ok(Action::await_change())
}

/// Remove a database's storage; with `wipe` also its snapshots and secrets
///
/// Steps run in order and each is complete only once its list is observed
/// empty. Returns `false` while anything is still going away.
pub async fn purge_storage(
    ns: &str,
    db_name: &str,
    spec: &MySQLSpec,
    wipe: bool,
    ctx: &Context,
) -> Result<bool> {
    if wipe && !delete_snapshots(ns, db_name, ctx).await? {
        debug!(namespace = ns, name = db_name, "Waiting for snapshots to be deleted");
        return Ok(false);
    }

    ctx.repos.statefulsets.delete(ns, db_name).await?;
    if ctx.repos.statefulsets.get(ns, db_name).await?.is_some() {
        return Ok(false);
    }

    if !delete_pvcs(ns, db_name, ctx).await? {
        debug!(namespace = ns, name = db_name, "Waiting for PVCs to be deleted");
        return Ok(false);
    }

    if wipe && !delete_secrets(ns, db_name, spec, ctx).await? {
        return Ok(false);
    }
    Ok(true)
}

async fn delete_snapshots(ns: &str, db_name: &str, ctx: &Context) -> Result<bool> {
    let snapshots: Vec<_> = ctx
        .repos
        .snapshots
        .list(ns, &Default::default())
        .await?
        .into_iter()
        .filter(|s| s.spec.database_name == db_name)
        .collect();
    for snapshot in snapshots.iter().filter(|s| !is_deleting(*s)) {
        ctx.repos.snapshots.delete(ns, &snapshot.name_any()).await?;
    }
    Ok(snapshots.is_empty())
}

/// PVCs held by pvc-protection count as gone once they are terminating
async fn delete_pvcs(ns: &str, db_name: &str, ctx: &Context) -> Result<bool> {
    let selector = database_selector(KIND_MYSQL, db_name);
    let pvcs = ctx.repos.pvcs.list(ns, &selector).await?;
    for pvc in pvcs.iter().filter(|p| !is_deleting(*p)) {
        ctx.repos.pvcs.delete(ns, &pvc.name_any()).await?;
    }
    let remaining = ctx.repos.pvcs.list(ns, &selector).await?;
    Ok(remaining.iter().all(is_deleting))
}

/// Delete operator-managed secrets; user-supplied ones are never touched
async fn delete_secrets(ns: &str, db_name: &str, spec: &MySQLSpec, ctx: &Context) -> Result<bool> {
    let mut names: Vec<String> = ctx
        .repos
        .secrets
        .list(ns, &database_selector(KIND_MYSQL, db_name))
        .await?
        .iter()
        .filter(|s| is_operator_managed(*s))
        .map(|s| s.name_any())
        .collect();

    let referenced = effective_secret_name(spec, db_name);
    if !names.contains(&referenced) {
        if let Some(secret) = ctx.repos.secrets.get(ns, &referenced).await? {
            if is_operator_managed(&secret) {
                names.push(referenced);
            }
        }
    }

    if names.is_empty() {
        return Ok(true);
    }
    for name in &names {
        ctx.repos.secrets.delete(ns, name).await?;
    }
    Ok(false)
}

/// What a MySQL object's relation to a DormantDatabase of the same name means
#[derive(Debug)]
pub enum ResumeState {
    /// No dormant database; a fresh provision
    NotDormant,
    /// The dormant database isn't settled yet
    Wait(String),
    /// Resume from this dormant database
    Resume(Box<DormantDatabase>),
}

/// Decide whether `mysql` resumes `dormant`
pub fn resume_state(mysql: &MySQL, dormant: Option<&DormantDatabase>) -> Result<ResumeState> {
    let Some(dormant) = dormant else {
        return Ok(ResumeState::NotDormant);
    };
    if is_deleting(dormant) {
        return Ok(ResumeState::Wait("dormant database is being deleted".to_string()));
    }

    match dormant.phase() {
        None | Some(DormantPhase::Pausing) => Ok(ResumeState::Wait(
            "dormant database is still pausing".to_string(),
        )),
        Some(DormantPhase::WipedOut) => Err(Error::ValidationError(format!(
            "dormant database {} was wiped out; delete it before creating a new database",
            dormant.name_any()
        ))),
        Some(DormantPhase::Paused | DormantPhase::Resuming) => {
            let origin = &dormant.spec.origin;
            let wanted = mysql.secret_name();
            let archived = effective_secret_name(&origin.spec.mysql, &origin.metadata.name);
            if wanted != archived {
                return Err(Error::ValidationError(format!(
                    "database secret {wanted} does not match {archived} of the dormant database"
                )));
            }
            Ok(ResumeState::Resume(Box::new(dormant.clone())))
        }
    }
}

/// Whether resuming `dormant` brings back data an init source already filled
///
/// The marker is copied onto the resumed database, so its init source is
/// never looked at again.
pub fn restores_initialized_data(dormant: &DormantDatabase) -> bool {
    !dormant.spec.wipe_out
        && dormant.phase() != Some(DormantPhase::WipedOut)
        && dormant
            .spec
            .origin
            .metadata
            .annotations
            .contains_key(ANNOTATION_INITIALIZED)
}

/// Start resuming `mysql` from `dormant`
pub async fn begin_resume(mysql: &MySQL, dormant: &DormantDatabase, ctx: &Context) -> Result<Action> {
    let ns = mysql.namespace().unwrap_or_default();
    let name = mysql.name_any();

    if dormant.phase() == Some(DormantPhase::Paused) {
        set_dormant_phase(dormant, DormantPhase::Resuming, ctx).await?;
    }

    let mut mysql = mysql.clone();
    let carried = dormant
        .spec
        .origin
        .metadata
        .annotations
        .get(ANNOTATION_INITIALIZED);
    if let Some(marker) = carried {
        if !mysql.annotations().contains_key(ANNOTATION_INITIALIZED) {
            mysql
                .annotations_mut()
                .insert(ANNOTATION_INITIALIZED.to_string(), marker.clone());
            mysql = ctx.repos.mysqls.replace(&ns, &mysql).await?;
        }
    }

    apply_event(
        &mysql,
        DatabaseEvent::ResumeRequested,
        &TransitionContext::default(),
        None,
        ctx,
    )
    .await?;
    info!(namespace = %ns, name = %name, "Resuming dormant database");
    ctx.publish(
        &mysql,
        EventType::Normal,
        reasons::RESUMING,
        actions::RESUME,
        Some(format!("resuming from DormantDatabase {name}")),
    )
    .await;
    Ok(Action::requeue(std::time::Duration::ZERO))
}

/// Drop the dormant database once the resumed MySQL runs
pub async fn finish_resume(mysql: &MySQL, dormant: &DormantDatabase, ctx: &Context) -> Result<()> {
    if is_deleting(dormant) {
        return Ok(());
    }
    let ns = mysql.namespace().unwrap_or_default();
    ctx.repos
        .dormant_databases
        .delete(&ns, &dormant.name_any())
        .await?;
    info!(namespace = %ns, name = %mysql.name_any(), "Resume complete, dormant database removed");
    ctx.publish(mysql, EventType::Normal, reasons::RESUMED, actions::RESUME, None)
        .await;
    Ok(())
}

/// Move a dormant database to `phase`; returns whether status was written
pub async fn set_dormant_phase(
    dormant: &DormantDatabase,
    phase: DormantPhase,
    ctx: &Context,
) -> Result<bool> {
    let current = dormant.status.clone().unwrap_or_default();
    if let Some(from) = current.phase {
        if from != phase && !from.can_transition_to(phase) {
            warn!(name = %dormant.name_any(), %from, to = %phase, "Ignoring invalid dormant transition");
            return Ok(false);
        }
    }

    let now = Utc::now().to_rfc3339();
    let desired = DormantDatabaseStatus {
        phase: Some(phase),
        observed_generation: dormant.metadata.generation,
        pausing_time: match phase {
            DormantPhase::Pausing if current.phase != Some(DormantPhase::Pausing) => {
                Some(now.clone())
            }
            _ => current.pausing_time.clone(),
        },
        wipe_out_time: match phase {
            DormantPhase::WipedOut if current.wipe_out_time.is_none() => Some(now),
            _ => current.wipe_out_time.clone(),
        },
        reason: current.reason.clone(),
    };
    let ns = dormant.namespace().unwrap_or_default();
    write_status(
        ctx.repos.dormant_databases.as_ref(),
        &ns,
        &dormant.name_any(),
        dormant.status.as_ref(),
        &desired,
    )
    .await
}

/// Reconcile a DormantDatabase
#[tracing::instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile_dormant(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let ns = key.namespace.as_str();
    let Some(dormant) = ctx.repos.dormant_databases.get(ns, &key.name).await? else {
        return Ok(Action::await_change());
    };

    if is_deleting(&dormant) {
        if dormant.spec.wipe_out && dormant.phase() != Some(DormantPhase::WipedOut) {
            if !purge_storage(ns, &key.name, &dormant.spec.origin.spec.mysql, true, ctx).await? {
                return Ok(Action::requeue(ctx.config.short_requeue));
            }
            info!(namespace = ns, name = %key.name, "Wiped out dormant database before deletion");
        }
        remove_finalizer(ctx.repos.dormant_databases.as_ref(), ns, &dormant).await?;
        return Ok(Action::await_change());
    }

    let dormant = add_finalizer(ctx.repos.dormant_databases.as_ref(), ns, &dormant).await?;

    match dormant.phase() {
        None => {
            set_dormant_phase(&dormant, DormantPhase::Pausing, ctx).await?;
            Ok(Action::requeue(ctx.config.short_requeue))
        }
        Some(DormantPhase::Pausing) => {
            ctx.repos.statefulsets.delete(ns, &key.name).await?;
            if ctx.repos.statefulsets.get(ns, &key.name).await?.is_some() {
                return Ok(Action::requeue(ctx.config.short_requeue));
            }
            set_dormant_phase(&dormant, DormantPhase::Paused, ctx).await?;
            info!(namespace = ns, name = %key.name, "Dormant database paused");
            Ok(Action::requeue(std::time::Duration::ZERO))
        }
        Some(DormantPhase::Paused) if dormant.spec.wipe_out => {
            ctx.publish(
                &dormant,
                EventType::Normal,
                reasons::WIPING_OUT,
                actions::WIPE_OUT,
                None,
            )
            .await;
            if !purge_storage(ns, &key.name, &dormant.spec.origin.spec.mysql, true, ctx).await? {
                return Ok(Action::requeue(ctx.config.short_requeue));
            }
            set_dormant_phase(&dormant, DormantPhase::WipedOut, ctx).await?;
            ctx.publish(
                &dormant,
                EventType::Normal,
                reasons::WIPED_OUT,
                actions::WIPE_OUT,
                None,
            )
            .await;
            ctx.repos.dormant_databases.delete(ns, &key.name).await?;
            Ok(Action::await_change())
        }
        Some(DormantPhase::Paused) => Ok(Action::await_change()),
        Some(DormantPhase::Resuming) => {
            if ctx.repos.mysqls.get(ns, &key.name).await?.is_none() {
                info!(namespace = ns, name = %key.name, "Resuming database vanished, back to Paused");
                set_dormant_phase(&dormant, DormantPhase::Paused, ctx).await?;
            }
            Ok(Action::await_change())
        }
        Some(DormantPhase::WipedOut) => {
            ctx.repos.dormant_databases.delete(ns, &key.name).await?;
            Ok(Action::await_change())
        }
    }
}
