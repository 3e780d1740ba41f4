pub mod cache;
pub mod context;
pub mod dormant;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod init;
pub mod proxysql;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod snapshot;
pub mod state_machine;
pub mod status;
pub mod validation;
pub mod worker;

pub use cache::WatchCache;
pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher, RecordingEventPublisher};
pub use queue::{ObjectKey, QueueKey, WorkKind, WorkQueue};
pub use reconciler::reconcile_mysql;
pub use scheduler::{BackupScheduler, Cadence};
pub use state_machine::{DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager, spec_changed};
pub use validation::{MAX_REPLICAS, MIN_REPLICAS};
pub use worker::{Action, process, run_workers};
