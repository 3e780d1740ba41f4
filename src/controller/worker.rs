//! Reconcile worker pool
//!
//! A fixed number of workers pull keys from the shared [`WorkQueue`]. The
//! queue never hands the same key to two workers, so every object is
//! reconciled by at most one worker at a time. Outcomes map onto the queue:
//! requeue delays become delayed adds, conflicts are retried at once and other
//! failures back off until the retry ceiling marks the object Failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::events::EventType;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::events::{actions, reasons};
use crate::controller::queue::{QueueKey, WorkKind};
use crate::controller::state_machine::{DatabaseEvent, TransitionContext};
use crate::controller::status::{StatusManager, write_status};
use crate::controller::{Error, Result, dormant, proxysql, reconciler, scheduler, snapshot};
use crate::crd::{DatabasePhase, ProxySQLStatus};

/// What a reconcile pass asks of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`; zero means right after this pass
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Nothing to do until a watch event arrives
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Run `ctx.config.workers` workers until `shutdown` fires
pub async fn run_workers(ctx: Arc<Context>, shutdown: CancellationToken) {
    let mut workers = JoinSet::new();
    for id in 0..ctx.config.workers {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        workers.spawn(async move { worker_loop(id, ctx, shutdown).await });
    }
    info!(workers = ctx.config.workers, "Reconcile workers started");

    shutdown.cancelled().await;
    ctx.queue.shutdown();
    ctx.scheduler.shutdown();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task panicked");
        }
    }
    info!("Reconcile workers stopped");
}

async fn worker_loop(id: usize, ctx: Arc<Context>, shutdown: CancellationToken) {
    loop {
        let key = tokio::select! {
            _ = shutdown.cancelled() => break,
            key = ctx.queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };
        debug!(worker = id, %key, "Processing");
        process(&key, &ctx).await;
        ctx.queue.done(&key);
    }
}

/// Reconcile one key and feed the outcome back into the queue
pub async fn process(key: &QueueKey, ctx: &Context) {
    let started = Instant::now();
    let result = dispatch(key, ctx).await;

    if let Some(health) = &ctx.metrics {
        health.metrics.record_reconcile(
            &key.kind.to_string(),
            &key.object.namespace,
            &key.object.name,
            started.elapsed().as_secs_f64(),
        );
        health.metrics.set_queue_depth(ctx.queue.len());
    }

    match result {
        Ok(action) => {
            ctx.reset_errors(key);
            if let Some(health) = &ctx.metrics {
                health.touch_reconcile();
            }
            if let Some(delay) = action.requeue_after() {
                ctx.queue.add_after(key.clone(), delay);
            }
        }
        Err(e) => handle_error(key, e.classify(), ctx).await,
    }
}

async fn dispatch(key: &QueueKey, ctx: &Context) -> Result<Action> {
    match key.kind {
        WorkKind::MySql => reconciler::reconcile_mysql(&key.object, ctx).await,
        WorkKind::ProxySql => proxysql::reconcile_proxysql(&key.object, ctx).await,
        WorkKind::DormantDatabase => dormant::reconcile_dormant(&key.object, ctx).await,
        WorkKind::Snapshot => snapshot::reconcile_snapshot(&key.object, ctx).await,
        WorkKind::ScheduledBackup => scheduler::run_scheduled_backup(&key.object, ctx).await,
    }
}

async fn handle_error(key: &QueueKey, error: Error, ctx: &Context) {
    if error.is_conflict() {
        debug!(%key, error = %error, "Conflict, retrying with a fresh read");
        ctx.queue.add(key.clone());
        return;
    }
    if error.is_not_found() {
        debug!(%key, "Object no longer exists");
        ctx.reset_errors(key);
        return;
    }

    if let Some(health) = &ctx.metrics {
        health.metrics.record_error(
            &key.kind.to_string(),
            &key.object.namespace,
            &key.object.name,
        );
    }

    if error.is_permanent() {
        warn!(%key, error = %error, "Permanent failure");
        if let Err(e) = mark_failed(key, &error, true, ctx).await {
            warn!(%key, error = %e, "Failed to record failure");
            ctx.queue.add_after(key.clone(), ctx.config.short_requeue);
        }
        return;
    }

    let attempts = ctx.record_error(key, &error);
    if attempts >= ctx.config.max_retries {
        error!(%key, attempts, error = %error, "Retry ceiling reached");
        match mark_failed(key, &error, false, ctx).await {
            Ok(()) => ctx.reset_errors(key),
            Err(e) => warn!(%key, error = %e, "Failed to record failure"),
        }
    }
    let delay = ctx.config.backoff.delay_for_error(&error, attempts);
    warn!(%key, attempts, delay_secs = delay.as_secs(), error = %error, "Reconcile failed, backing off");
    ctx.queue.add_after(key.clone(), delay);
}

/// Record `Failed` on the object behind `key`, if its kind has a phase
async fn mark_failed(key: &QueueKey, error: &Error, validation: bool, ctx: &Context) -> Result<()> {
    let ns = key.object.namespace.as_str();
    let message = error.to_string();
    match key.kind {
        WorkKind::MySql => {
            let Some(mysql) = ctx.repos.mysqls.get(ns, &key.object.name).await? else {
                return Ok(());
            };
            if mysql.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            let event = if validation {
                DatabaseEvent::ValidationFailed
            } else {
                DatabaseEvent::RetriesExhausted
            };
            let current = mysql.phase().unwrap_or(DatabasePhase::Provisioning);
            let next = ctx
                .state_machine
                .transition(&current, event, &TransitionContext::default())
                .resulting_phase();
            if next != DatabasePhase::Failed {
                return Ok(());
            }
            let status = StatusManager::new(&mysql, ctx.repos.mysqls.as_ref(), ns);
            if status.set_failed(validation, &message).await? {
                let reason = if validation {
                    reasons::VALIDATION_FAILED
                } else {
                    reasons::FAILED
                };
                ctx.publish(&mysql, EventType::Warning, reason, actions::RECONCILE, Some(message))
                    .await;
            }
        }
        WorkKind::ProxySql => {
            let Some(proxysql) = ctx.repos.proxysqls.get(ns, &key.object.name).await? else {
                return Ok(());
            };
            let desired = ProxySQLStatus {
                phase: Some(DatabasePhase::Failed),
                observed_generation: proxysql.metadata.generation,
                reason: Some(message.clone()),
                conditions: proxysql
                    .status
                    .as_ref()
                    .map(|s| s.conditions.clone())
                    .unwrap_or_default(),
            };
            let written = write_status(
                ctx.repos.proxysqls.as_ref(),
                ns,
                &proxysql.name_any(),
                proxysql.status.as_ref(),
                &desired,
            )
            .await?;
            if written {
                ctx.publish(
                    &proxysql,
                    EventType::Warning,
                    reasons::FAILED,
                    actions::RECONCILE,
                    Some(message),
                )
                .await;
            }
        }
        WorkKind::DormantDatabase | WorkKind::Snapshot | WorkKind::ScheduledBackup => {
            warn!(%key, error = %message, "Giving up until the object changes");
        }
    }
    Ok(())
}
