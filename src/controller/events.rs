//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never fails a
//! reconcile.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: hostname::get().ok().and_then(|h| h.into_string().ok()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// One event captured by [`RecordingEventPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: Option<String>,
    pub name: Option<String>,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Keeps every published event in memory so tests can assert on them
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = RecordedEvent {
            kind: resource_ref.kind.clone(),
            name: resource_ref.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        };
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const PROVISIONING: &str = "Provisioning";
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
    pub const READY: &str = "Ready";
    pub const INITIALIZING: &str = "Initializing";
    pub const INITIALIZED: &str = "Initialized";
    pub const INIT_FAILED: &str = "InitFailed";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const FAILED: &str = "Failed";
    pub const READINESS_TIMEOUT: &str = "ReadinessTimeout";

    pub const PAUSING: &str = "Pausing";
    pub const PAUSED: &str = "Paused";
    pub const RESUMING: &str = "Resuming";
    pub const RESUMED: &str = "Resumed";
    pub const WIPING_OUT: &str = "WipingOut";
    pub const WIPED_OUT: &str = "WipedOut";
    pub const DELETING: &str = "Deleting";
    pub const DELETION_BLOCKED: &str = "DeletionBlocked";

    pub const BACKUP_SCHEDULED: &str = "BackupScheduled";
    pub const BACKUP_SKIPPED: &str = "BackupSkipped";
    pub const SNAPSHOT_STARTED: &str = "SnapshotStarted";
    pub const SNAPSHOT_SUCCEEDED: &str = "SnapshotSucceeded";
    pub const SNAPSHOT_FAILED: &str = "SnapshotFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CREATE: &str = "Create";
    pub const INITIALIZE: &str = "Initialize";
    pub const PAUSE: &str = "Pause";
    pub const RESUME: &str = "Resume";
    pub const DELETE: &str = "Delete";
    pub const WIPE_OUT: &str = "WipeOut";
    pub const BACKUP: &str = "Backup";
}
