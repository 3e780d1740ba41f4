use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mysql_operator::health::{HealthState, run_health_server};
use mysql_operator::store::Repositories;
use mysql_operator::{OperatorConfig, RunArgs, run_operator, run_webhook_server};

/// Kubernetes operator for MySQL databases
#[derive(Parser)]
#[command(name = "mysql-operator", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers, the health server and optionally the webhook
    Run(RunArgs),
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Command::Version => {
            println!("mysql-operator {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Run(args) => args,
    };

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        bail!("Failed to install rustls crypto provider and no provider is available");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mysql_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mysql-operator");

    let config = OperatorConfig::from_args(&args).context("invalid configuration")?;
    let client = build_client(&args).await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let lease_lost = CancellationToken::new();
    let health = Arc::new(HealthState::new());

    // Probes answer even while waiting for leadership
    let health_handle = {
        let health = health.clone();
        let port = args.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let webhook_handle = if args.enable_webhook {
        let cert = args.webhook_cert_dir.join("tls.crt");
        let key = args.webhook_cert_dir.join("tls.key");
        if !cert.exists() || !key.exists() {
            bail!(
                "webhook enabled but {} or {} is missing",
                cert.display(),
                key.display()
            );
        }
        let repos = Repositories::direct(&client);
        let port = args.webhook_port;
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(repos, &cert, &key, port).await {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!("Webhook server disabled");
        None
    };

    let lease_handle = if args.leader_elect {
        Some(acquire_leadership(&client, &args, shutdown.clone(), lease_lost.clone()).await?)
    } else {
        None
    };

    let mut operator_handle = {
        let client = client.clone();
        let health = health.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_operator(client, config, health, shutdown).await })
    };

    let webhook_future = async {
        match webhook_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Webhook server task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = &mut operator_handle => {
            return match result {
                Ok(Ok(())) if lease_lost.is_cancelled() => Err(anyhow!("leadership lost")),
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("operator stopped"),
                Err(e) => Err(e).context("operator task panicked"),
            };
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = webhook_future => {}
        _ = lease_lost.cancelled() => {
            warn!("Leadership lost, shutting down");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    health.set_ready(false).await;
    shutdown.cancel();
    if let Some(handle) = lease_handle {
        handle.abort();
    }
    match operator_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Operator stopped with an error"),
        Err(e) => error!("Operator task panicked: {}", e),
    }

    if lease_lost.is_cancelled() {
        bail!("leadership lost");
    }
    info!("Operator stopped");
    Ok(())
}

async fn build_client(args: &RunArgs) -> anyhow::Result<Client> {
    let Some(path) = &args.kubeconfig else {
        return Client::try_default()
            .await
            .context("failed to create Kubernetes client");
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("invalid kubeconfig")?;
    Client::try_from(config).context("failed to create Kubernetes client")
}

fn holder_identity() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

/// Block until the lease is held, then renew it in the background.
///
/// The renewal task cancels `lease_lost` and `shutdown` when the lease is lost.
async fn acquire_leadership(
    client: &Client,
    args: &RunArgs,
    shutdown: CancellationToken,
    lease_lost: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let holder_id = holder_identity();
    let renew_every = Duration::from_secs(args.lease_renew_secs);
    let lease_lock = LeaseLock::new(
        client.clone(),
        &args.lease_namespace,
        LeaseLockParams {
            holder_id: holder_id.clone(),
            lease_name: args.lease_name.clone(),
            lease_ttl: Duration::from_secs(args.lease_ttl_secs),
        },
    );

    info!(
        holder_id = %holder_id,
        namespace = %args.lease_namespace,
        lease_name = %args.lease_name,
        "Waiting to acquire leadership..."
    );
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::select! {
            _ = shutdown_signal() => bail!("interrupted while waiting for leadership"),
            _ = tokio::time::sleep(renew_every) => {}
        }
    }

    Ok(tokio::spawn(async move {
        loop {
            tokio::time::sleep(renew_every).await;
            match lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    lease_lost.cancel();
                    shutdown.cancel();
                    return;
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    lease_lost.cancel();
                    shutdown.cancel();
                    return;
                }
            }
        }
    }))
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
