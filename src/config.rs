//! Operator configuration
//!
//! Every setting comes from a `run` flag with a `MYSQL_OPERATOR_*` environment
//! fallback. [`OperatorConfig`] is the validated, typed form handed to the
//! controllers.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::controller::{BackoffConfig, Error, Result};

/// Flags of the `run` subcommand
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to a kubeconfig file; in-cluster config or $KUBECONFIG otherwise.
    #[arg(long, env = "MYSQL_OPERATOR_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Acquire a Lease before starting the workers.
    #[arg(long, env = "MYSQL_OPERATOR_LEADER_ELECT", default_value_t = false)]
    pub leader_elect: bool,

    /// Namespace holding the leader election Lease.
    #[arg(long, env = "MYSQL_OPERATOR_LEASE_NAMESPACE", default_value = "kube-system")]
    pub lease_namespace: String,

    #[arg(long, env = "MYSQL_OPERATOR_LEASE_NAME", default_value = "mysql-operator-leader")]
    pub lease_name: String,

    /// Lease duration in seconds.
    #[arg(long, env = "MYSQL_OPERATOR_LEASE_TTL", default_value_t = 15)]
    pub lease_ttl_secs: u64,

    /// Lease renewal interval in seconds.
    #[arg(long, env = "MYSQL_OPERATOR_LEASE_RENEW", default_value_t = 5)]
    pub lease_renew_secs: u64,

    /// Number of reconcile workers.
    #[arg(long, env = "MYSQL_OPERATOR_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Registry the MySQL and ProxySQL images are pulled from.
    #[arg(long, env = "MYSQL_OPERATOR_IMAGE_REGISTRY", default_value = "kubedb")]
    pub image_registry: String,

    /// Image running backup, restore and snapshot-delete jobs.
    #[arg(
        long,
        env = "MYSQL_OPERATOR_BACKUP_TASK_IMAGE",
        default_value = "kubedb/mysql-tools:8.0.21"
    )]
    pub backup_task_image: String,

    /// Only watch this namespace; all namespaces when unset.
    #[arg(long, env = "MYSQL_OPERATOR_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "MYSQL_OPERATOR_HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Serve the admission webhook.
    #[arg(long, env = "MYSQL_OPERATOR_ENABLE_WEBHOOK", default_value_t = false)]
    pub enable_webhook: bool,

    #[arg(long, env = "MYSQL_OPERATOR_WEBHOOK_PORT", default_value_t = 8443)]
    pub webhook_port: u16,

    #[arg(
        long,
        env = "MYSQL_OPERATOR_WEBHOOK_CERT_DIR",
        default_value = "/etc/webhook/certs"
    )]
    pub webhook_cert_dir: PathBuf,

    /// Consecutive failures before a database is marked Failed.
    #[arg(long, env = "MYSQL_OPERATOR_MAX_RETRIES", default_value_t = 10)]
    pub max_retries: u32,

    /// Seconds a workload may take to become ready before the database fails.
    #[arg(long, env = "MYSQL_OPERATOR_READINESS_TIMEOUT", default_value_t = 1800)]
    pub readiness_timeout_secs: u64,
}

/// Validated operator settings
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub workers: usize,
    pub image_registry: String,
    pub backup_task_image: String,
    pub namespace: Option<String>,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Requeue while waiting on something that will change soon
    pub short_requeue: Duration,
    /// Periodic resync of settled objects
    pub resync: Duration,
    pub readiness_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            image_registry: "kubedb".to_string(),
            backup_task_image: "kubedb/mysql-tools:8.0.21".to_string(),
            namespace: None,
            max_retries: 10,
            backoff: BackoffConfig::default(),
            short_requeue: Duration::from_secs(5),
            resync: Duration::from_secs(300),
            readiness_timeout: Duration::from_secs(1800),
        }
    }
}

impl OperatorConfig {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        if args.workers == 0 {
            return Err(Error::InvalidConfig("--workers must be at least 1".into()));
        }
        if args.max_retries == 0 {
            return Err(Error::InvalidConfig("--max-retries must be at least 1".into()));
        }
        if args.lease_renew_secs >= args.lease_ttl_secs {
            return Err(Error::InvalidConfig(format!(
                "lease renew interval ({}s) must be shorter than the lease TTL ({}s)",
                args.lease_renew_secs, args.lease_ttl_secs
            )));
        }
        if args.backup_task_image.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "--backup-task-image must not be empty".into(),
            ));
        }

        Ok(Self {
            workers: args.workers,
            image_registry: args.image_registry.trim_end_matches('/').to_string(),
            backup_task_image: args.backup_task_image.clone(),
            namespace: args.namespace.clone().filter(|ns| !ns.is_empty()),
            max_retries: args.max_retries,
            readiness_timeout: Duration::from_secs(args.readiness_timeout_secs),
            ..Default::default()
        })
    }
}
