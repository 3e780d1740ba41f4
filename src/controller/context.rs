use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kube::Resource;
use kube::runtime::events::EventType;

use crate::config::OperatorConfig;
use crate::controller::error::{Error, ErrorContext};
use crate::controller::events::EventPublisher;
use crate::controller::queue::{QueueKey, WorkQueue};
use crate::controller::scheduler::BackupScheduler;
use crate::controller::state_machine::DatabaseStateMachine;
use crate::health::HealthState;
use crate::store::Repositories;

/// Shared context for the controllers, built once at startup
pub struct Context {
    pub repos: Repositories,
    pub events: Arc<dyn EventPublisher>,
    pub queue: Arc<WorkQueue<QueueKey>>,
    pub scheduler: Arc<BackupScheduler>,
    pub config: Arc<OperatorConfig>,
    /// Absent in tests that don't look at metrics
    pub metrics: Option<Arc<HealthState>>,
    pub state_machine: DatabaseStateMachine,
    errors: Mutex<HashMap<QueueKey, ErrorContext>>,
}

impl Context {
    pub fn new(
        repos: Repositories,
        events: Arc<dyn EventPublisher>,
        queue: Arc<WorkQueue<QueueKey>>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            repos,
            events,
            scheduler: Arc::new(BackupScheduler::new(queue.clone())),
            queue,
            config: Arc::new(config),
            metrics: None,
            state_machine: DatabaseStateMachine::new(),
            errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthState>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish an event about `object`; failures are only logged
    pub async fn publish<K>(
        &self,
        object: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let reference = object.object_ref(&());
        self.events
            .publish(&reference, type_, reason, action, note)
            .await;
    }

    /// Count a failure for `key`; returns the consecutive failure count
    pub fn record_error(&self, key: &QueueKey, error: &Error) -> u32 {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = errors.entry(key.clone()).or_default();
        entry.record_error(error);
        entry.consecutive_errors
    }

    pub fn reset_errors(&self, key: &QueueKey) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn error_context(&self, key: &QueueKey) -> ErrorContext {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}
