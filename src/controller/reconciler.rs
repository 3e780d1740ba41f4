//! Reconciliation logic for MySQL resources
//!
//! One pass brings the child objects in line with the MySQL object's spec, observes the
//! workload and the init source, and records the phase the state machine
//! lands on. Deletion is handed to the dormant-database manager.

use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dormant::{self, ResumeState, resume_state};
use crate::controller::events::{actions, reasons};
use crate::controller::finalizer::{add_finalizer, is_deleting};
use crate::controller::init::{InitProgress, check_init, stamp_initialized, verify_init_source};
use crate::controller::queue::ObjectKey;
use crate::controller::state_machine::{
    DatabaseEvent, TransitionContext, TransitionResult, determine_event,
};
use crate::controller::status::{StatusManager, seconds_in_phase, spec_changed};
use crate::controller::validation::validate_mysql;
use crate::controller::worker::Action;
use crate::controller::{Error, Result};
use crate::crd::{DatabasePhase, DormantPhase, MySQL};
use crate::resources::common::{Applied, ensure_absent_created, ensure_object};
use crate::resources::{app_binding, pdb, secret, service, statefulset};

/// Reconcile the MySQL object at `key`
#[instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile_mysql(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let ns = key.namespace.as_str();
    let Some(mysql) = ctx.repos.mysqls.get(ns, &key.name).await? else {
        ctx.scheduler.remove(key);
        return Ok(Action::await_change());
    };

    if is_deleting(&mysql) {
        return dormant::handle_deletion(&mysql, ctx).await;
    }

    if mysql.phase() == Some(DatabasePhase::Failed) && !spec_changed(&mysql) {
        debug!("Failed and unchanged, waiting for a spec change");
        ctx.scheduler.remove(key);
        return Ok(Action::await_change());
    }

    validate_mysql(&mysql)?;
    let dormant = ctx.repos.dormant_databases.get(ns, &key.name).await?;
    verify_init_source(&mysql, dormant.as_ref(), ctx).await?;

    if matches!(mysql.phase(), None | Some(DatabasePhase::Provisioning)) {
        match resume_state(&mysql, dormant.as_ref())? {
            ResumeState::Wait(reason) => {
                info!(%reason, "Waiting on dormant database");
                return Ok(Action::requeue(ctx.config.short_requeue));
            }
            ResumeState::Resume(dormant) => {
                let mysql = add_finalizer(ctx.repos.mysqls.as_ref(), ns, &mysql).await?;
                return dormant::begin_resume(&mysql, &dormant, ctx).await;
            }
            ResumeState::NotDormant => {}
        }
    }

    let mysql = add_finalizer(ctx.repos.mysqls.as_ref(), ns, &mysql).await?;

    match &mysql.spec.backup_schedule {
        Some(schedule) => {
            if ctx.scheduler.ensure(key, &schedule.cron_expression)? {
                info!(schedule = %schedule.cron_expression, "Backup schedule installed");
            }
        }
        None => {
            if ctx.scheduler.remove(key) {
                info!("Backup schedule removed");
            }
        }
    }

    apply_children(&mysql, ctx).await?;

    let (ready, desired) = match ctx.repos.statefulsets.get(ns, &key.name).await? {
        Some(sts) => statefulset::readiness(&sts),
        None => (0, mysql.spec.replicas),
    };
    let workload_ready = desired > 0 && ready >= desired;

    let init = check_init(&mysql, workload_ready, ctx).await?;
    if let InitProgress::Failed(message) = &init {
        warn!(%message, "Initialization failed");
        let status = StatusManager::new(&mysql, ctx.repos.mysqls.as_ref(), ns);
        if status.set_failed(false, message).await? {
            ctx.publish(
                &mysql,
                EventType::Warning,
                reasons::INIT_FAILED,
                actions::INITIALIZE,
                Some(message.clone()),
            )
            .await;
        }
        return Ok(Action::await_change());
    }

    let mysql = match &init {
        InitProgress::Complete { stamp_marker: true } => stamp_initialized(&mysql, ctx).await?,
        _ => mysql,
    };

    let observed = TransitionContext::new(ready, desired)
        .with_init_pending(init.is_pending())
        .with_spec_changed(spec_changed(&mysql));
    let current = mysql.phase().unwrap_or(DatabasePhase::Provisioning);
    let event = determine_event(&current, &observed);
    let next = log_transition(&key.name, ctx.state_machine.transition(&current, event, &observed));

    if matches!(next, DatabasePhase::Provisioning | DatabasePhase::Resuming)
        && readiness_expired(&mysql, ctx.config.readiness_timeout)
    {
        let result = ctx
            .state_machine
            .transition(&next, DatabaseEvent::ReadinessTimeout, &observed);
        log_transition(&key.name, result);
        let message = format!(
            "workload not ready after {}s ({ready}/{desired} replicas ready)",
            ctx.config.readiness_timeout.as_secs()
        );
        let status = StatusManager::new(&mysql, ctx.repos.mysqls.as_ref(), ns);
        if status.set_failed(false, &message).await? {
            ctx.publish(
                &mysql,
                EventType::Warning,
                reasons::READINESS_TIMEOUT,
                actions::RECONCILE,
                Some(message),
            )
            .await;
        }
        return Ok(Action::await_change());
    }

    let reason = match (&init, next) {
        (InitProgress::Pending(reason), _) => Some(reason.clone()),
        (_, DatabasePhase::Running) => None,
        _ => Some(format!("{ready}/{desired} replicas ready")),
    };
    let status = StatusManager::new(&mysql, ctx.repos.mysqls.as_ref(), ns);
    let mut desired_status = status.desired(next, reason.as_deref());
    if matches!(init, InitProgress::Complete { .. }) {
        desired_status = StatusManager::with_initialized(
            desired_status,
            mysql.metadata.generation,
            "Init source applied",
        );
    }
    if status.write(desired_status).await? && mysql.phase() != Some(next) {
        announce_phase(&mysql, mysql.phase(), next, ctx).await;
    }

    if next == DatabasePhase::Running {
        if let Some(dormant) = dormant.filter(|d| d.phase() == Some(DormantPhase::Resuming)) {
            dormant::finish_resume(&mysql, &dormant, ctx).await?;
        }
        return Ok(Action::requeue(ctx.config.resync));
    }
    Ok(Action::requeue(ctx.config.short_requeue))
}

/// Create or update the database's child objects
async fn apply_children(mysql: &MySQL, ctx: &Context) -> Result<()> {
    let ns = mysql.namespace().unwrap_or_default();

    match &mysql.spec.database_secret {
        None => {
            let desired = secret::generate_database_secret(mysql);
            if ensure_absent_created(ctx.repos.secrets.as_ref(), &ns, &desired).await? {
                info!(secret = %desired.name_any(), "Generated database credentials");
            }
        }
        Some(reference) => {
            if ctx.repos.secrets.get(&ns, &reference.secret_name).await?.is_none() {
                return Err(Error::TransientError(format!(
                    "database secret {} not found",
                    reference.secret_name
                )));
            }
        }
    }

    let applied = [
        ensure_object(
            ctx.repos.services.as_ref(),
            &ns,
            service::generate_governing_service(mysql),
        )
        .await?,
        ensure_object(
            ctx.repos.services.as_ref(),
            &ns,
            service::generate_primary_service(mysql),
        )
        .await?,
        ensure_object(
            ctx.repos.statefulsets.as_ref(),
            &ns,
            statefulset::generate_mysql_statefulset(mysql, &ctx.config.image_registry),
        )
        .await?,
        ensure_object(ctx.repos.pdbs.as_ref(), &ns, pdb::generate_pdb(mysql)).await?,
        ensure_object(
            ctx.repos.app_bindings.as_ref(),
            &ns,
            app_binding::generate_app_binding(mysql),
        )
        .await?,
    ];

    if applied.contains(&Applied::Created) {
        ctx.publish(
            mysql,
            EventType::Normal,
            reasons::SUCCESSFUL_CREATE,
            actions::CREATE,
            Some("created database workload".to_string()),
        )
        .await;
    } else if applied.contains(&Applied::Updated) {
        ctx.publish(
            mysql,
            EventType::Normal,
            reasons::SUCCESSFUL_UPDATE,
            actions::RECONCILE,
            Some("updated database workload".to_string()),
        )
        .await;
    }
    Ok(())
}

fn readiness_expired(mysql: &MySQL, timeout: Duration) -> bool {
    let timeout = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    seconds_in_phase(mysql).is_some_and(|secs| secs > timeout)
}

fn log_transition(name: &str, result: TransitionResult) -> DatabasePhase {
    match &result {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } if from != to => {
            info!(db = name, %from, %to, "{}", description);
        }
        TransitionResult::GuardFailed { from, event, reason, .. } => {
            debug!(db = name, phase = %from, %event, %reason, "Transition guard not met");
        }
        TransitionResult::InvalidTransition { current, event } => {
            debug!(db = name, phase = %current, %event, "No transition");
        }
        TransitionResult::Success { .. } => {}
    }
    result.resulting_phase()
}

async fn announce_phase(
    mysql: &MySQL,
    from: Option<DatabasePhase>,
    to: DatabasePhase,
    ctx: &Context,
) {
    let (reason, action, note) = match to {
        DatabasePhase::Provisioning => (
            reasons::PROVISIONING,
            actions::CREATE,
            "creating database resources".to_string(),
        ),
        DatabasePhase::Initializing => (
            reasons::INITIALIZING,
            actions::INITIALIZE,
            "applying init source".to_string(),
        ),
        DatabasePhase::Running if from == Some(DatabasePhase::Initializing) => (
            reasons::INITIALIZED,
            actions::INITIALIZE,
            "init source applied, database is running".to_string(),
        ),
        DatabasePhase::Running => (
            reasons::READY,
            actions::RECONCILE,
            "database is running".to_string(),
        ),
        _ => return,
    };
    ctx.publish(mysql, EventType::Normal, reason, action, Some(note))
        .await;
}

/// Feed `event` through the state machine and record the resulting phase
pub(crate) async fn apply_event(
    mysql: &MySQL,
    event: DatabaseEvent,
    observed: &TransitionContext,
    reason: Option<&str>,
    ctx: &Context,
) -> Result<DatabasePhase> {
    let current = mysql.phase().unwrap_or(DatabasePhase::Provisioning);
    let next = log_transition(
        &mysql.name_any(),
        ctx.state_machine.transition(&current, event, observed),
    );
    let ns = mysql.namespace().unwrap_or_default();
    StatusManager::new(mysql, ctx.repos.mysqls.as_ref(), &ns)
        .set_phase(next, reason)
        .await?;
    Ok(next)
}
