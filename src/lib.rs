pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod store;
pub mod webhooks;

pub use config::{OperatorConfig, RunArgs};
pub use controller::{
    BackoffConfig, Context, Error, QueueKey, Result, WatchCache, WorkQueue, reconcile_mysql,
};
pub use crd::{DormantDatabase, MySQL, ProxySQL, Snapshot};
pub use health::{HealthState, Metrics};
pub use webhooks::{WEBHOOK_CERT_DIR, WEBHOOK_PORT, WebhookError, run_webhook_server};

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::cache::{KEY_CHANNEL_CAPACITY, forward_keys, report_metrics};
use controller::{KubeEventPublisher, run_workers};

const METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Run the operator until `shutdown` fires.
///
/// Starts the watch caches, waits for their initial sync, queues every known
/// object once and then runs the reconcile workers. Readiness is reported
/// through `health` once the workers are up.
pub async fn run_operator(
    client: Client,
    config: OperatorConfig,
    health: Arc<HealthState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let scope = config.namespace.clone();
    info!(
        scope = scope.as_deref().unwrap_or("cluster-wide"),
        workers = config.workers,
        "Starting controllers for MySQL, ProxySQL, DormantDatabase and Snapshot resources"
    );

    let mut tasks = JoinSet::new();
    let (tx, rx) = mpsc::channel(KEY_CHANNEL_CAPACITY);
    let cache = WatchCache::start(&client, scope.as_deref(), tx, &shutdown, &mut tasks);

    let queue = Arc::new(WorkQueue::new());
    tasks.spawn(forward_keys(rx, queue.clone(), shutdown.clone()));

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown before the watch caches synced");
            return Ok(());
        }
        synced = cache.wait_until_ready() => synced?,
    }

    let events = Arc::new(KubeEventPublisher::new(client.clone(), resources::FIELD_MANAGER));
    let ctx = Arc::new(
        Context::new(cache.repositories(&client), events, queue.clone(), config)
            .with_metrics(health.clone()),
    );
    cache.resync(&queue);

    tasks.spawn(report_metrics(
        cache.mysqls.clone(),
        queue,
        health.clone(),
        METRICS_INTERVAL,
        shutdown.clone(),
    ));

    health.set_ready(true).await;
    run_workers(ctx, shutdown.clone()).await;
    health.set_ready(false).await;

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Background task panicked");
        }
    }
    info!("Controllers stopped");
    Ok(())
}
