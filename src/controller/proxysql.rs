//! ProxySQL reconciler
//!
//! Children are owner-referenced, so deletion needs no finalizer.

use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument};

use crate::controller::context::Context;
use crate::controller::events::{actions, reasons};
use crate::controller::finalizer::is_deleting;
use crate::controller::queue::ObjectKey;
use crate::controller::status::{ConditionBuilder, write_status};
use crate::controller::validation::validate_proxysql;
use crate::controller::worker::Action;
use crate::controller::{Error, Result};
use crate::crd::{DatabasePhase, ProxySQL, ProxySQLStatus};
use crate::resources::common::{ensure_absent_created, ensure_object};
use crate::resources::{secret, service, statefulset};

#[instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile_proxysql(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let ns = key.namespace.as_str();
    let Some(proxysql) = ctx.repos.proxysqls.get(ns, &key.name).await? else {
        return Ok(Action::await_change());
    };
    if is_deleting(&proxysql) {
        return Ok(Action::await_change());
    }
    if proxysql.status.as_ref().and_then(|s| s.phase) == Some(DatabasePhase::Failed)
        && proxysql.status.as_ref().and_then(|s| s.observed_generation)
            == proxysql.metadata.generation
    {
        return Ok(Action::await_change());
    }

    validate_proxysql(&proxysql)?;

    let backend_name = &proxysql.spec.backend.ref_.name;
    let Some(backend) = ctx.repos.mysqls.get(ns, backend_name).await? else {
        debug!(backend = %backend_name, "Backend database not found");
        set_status(
            &proxysql,
            DatabasePhase::Provisioning,
            Some(format!("waiting for backend MySQL {backend_name}")),
            ctx,
        )
        .await?;
        return Ok(Action::requeue(ctx.config.short_requeue));
    };
    if !backend.is_group_replication() {
        return Err(Error::ValidationError(format!(
            "backend MySQL {backend_name} does not run group replication"
        )));
    }

    match &proxysql.spec.proxysql_secret {
        None => {
            let desired = secret::generate_proxysql_secret(&proxysql);
            if ensure_absent_created(ctx.repos.secrets.as_ref(), ns, &desired).await? {
                info!(secret = %desired.name_any(), "Generated ProxySQL credentials");
            }
        }
        Some(reference) => {
            if ctx.repos.secrets.get(ns, &reference.secret_name).await?.is_none() {
                return Err(Error::TransientError(format!(
                    "ProxySQL secret {} not found",
                    reference.secret_name
                )));
            }
        }
    }

    ensure_object(
        ctx.repos.services.as_ref(),
        ns,
        service::generate_proxysql_service(&proxysql),
    )
    .await?;
    ensure_object(
        ctx.repos.statefulsets.as_ref(),
        ns,
        statefulset::generate_proxysql_statefulset(
            &proxysql,
            &backend.name_any(),
            &ctx.config.image_registry,
        ),
    )
    .await?;

    let (ready, desired) = match ctx.repos.statefulsets.get(ns, &key.name).await? {
        Some(sts) => statefulset::readiness(&sts),
        None => (0, proxysql.spec.replicas),
    };
    if desired > 0 && ready >= desired {
        if set_status(&proxysql, DatabasePhase::Running, None, ctx).await? {
            info!("ProxySQL is running");
            ctx.publish(
                &proxysql,
                EventType::Normal,
                reasons::READY,
                actions::RECONCILE,
                Some(format!("routing to {backend_name}")),
            )
            .await;
        }
        return Ok(Action::requeue(ctx.config.resync));
    }

    set_status(
        &proxysql,
        DatabasePhase::Provisioning,
        Some(format!("{ready}/{desired} replicas ready")),
        ctx,
    )
    .await?;
    Ok(Action::requeue(ctx.config.short_requeue))
}

async fn set_status(
    proxysql: &ProxySQL,
    phase: DatabasePhase,
    reason: Option<String>,
    ctx: &Context,
) -> Result<bool> {
    let generation = proxysql.metadata.generation;
    let existing = proxysql
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let running = phase == DatabasePhase::Running;
    let message = reason.clone().unwrap_or_else(|| "ProxySQL is routing traffic".to_string());
    let conditions = ConditionBuilder::from_existing(existing, generation)
        .ready(running, if running { "Running" } else { "Provisioning" }, &message)
        .progressing(!running, if running { "Stable" } else { "Provisioning" }, &message)
        .build();

    let desired = ProxySQLStatus {
        phase: Some(phase),
        observed_generation: generation,
        reason,
        conditions,
    };
    let ns = proxysql.namespace().unwrap_or_default();
    write_status(
        ctx.repos.proxysqls.as_ref(),
        &ns,
        &proxysql.name_any(),
        proxysql.status.as_ref(),
        &desired,
    )
    .await
}
