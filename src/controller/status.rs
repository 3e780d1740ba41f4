//! Status and conditions management
//!
//! Status is written through the status subresource and only when the desired
//! value differs from the live one, so a settled object costs no writes.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::controller::error::Result;
use crate::crd::{Condition, DatabasePhase, MySQL, MySQLStatus};
use crate::store::{Object, Repository};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Database accepts connections
    pub const READY: &str = "Ready";
    /// Database is moving towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// The object's spec was rejected
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// The init source has been applied
    pub const INITIALIZED: &str = "Initialized";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition; the transition time only moves when the status flips
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Patch `desired` into the status subresource unless it equals `current`
///
/// Keys present in `current` but absent from `desired` are sent as `null` so
/// the merge patch removes them. Returns whether a write happened.
pub async fn write_status<K, S>(
    repo: &dyn Repository<K>,
    namespace: &str,
    name: &str,
    current: Option<&S>,
    desired: &S,
) -> Result<bool>
where
    K: Object,
    S: Serialize + PartialEq,
{
    if current == Some(desired) {
        return Ok(false);
    }

    let mut patch = serde_json::to_value(desired)?;
    if let (Some(current), Value::Object(patch_map)) = (current, &mut patch) {
        if let Value::Object(current_map) = serde_json::to_value(current)? {
            for key in current_map.keys() {
                patch_map.entry(key.clone()).or_insert(Value::Null);
            }
        }
    }

    repo.replace_status(namespace, name, patch).await?;
    Ok(true)
}

/// Status writer for MySQL objects
pub struct StatusManager<'a> {
    mysql: &'a MySQL,
    repo: &'a dyn Repository<MySQL>,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    pub fn new(mysql: &'a MySQL, repo: &'a dyn Repository<MySQL>, ns: &'a str) -> Self {
        Self { mysql, repo, ns }
    }

    /// Status the object would carry in `phase`
    pub fn desired(&self, phase: DatabasePhase, reason: Option<&str>) -> MySQLStatus {
        let generation = self.mysql.metadata.generation;
        let existing = self
            .mysql
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        let message = reason.unwrap_or_default();

        let builder = ConditionBuilder::from_existing(existing, generation);
        let conditions = match phase {
            DatabasePhase::Running => builder
                .ready(true, "DatabaseRunning", "Database is accepting connections")
                .progressing(false, "Stable", "Database is stable")
                .remove_condition(condition_types::VALIDATION_FAILED),
            DatabasePhase::Provisioning => builder
                .ready(false, "Provisioning", "Creating database resources")
                .progressing(true, "Provisioning", "Creating database resources")
                .remove_condition(condition_types::VALIDATION_FAILED),
            DatabasePhase::Initializing => builder
                .ready(false, "Initializing", message)
                .progressing(true, "Initializing", message),
            DatabasePhase::Resuming => builder
                .ready(false, "Resuming", "Restoring from dormant database")
                .progressing(true, "Resuming", "Restoring from dormant database"),
            DatabasePhase::Pausing | DatabasePhase::Paused => builder
                .ready(false, "Paused", "Database is being archived")
                .progressing(false, "Paused", "Database is being archived"),
            DatabasePhase::Terminating => builder
                .ready(false, "Terminating", "Database storage is being removed")
                .progressing(true, "Terminating", "Database storage is being removed"),
            DatabasePhase::Failed => builder
                .ready(false, "Failed", message)
                .progressing(false, "Failed", message),
        }
        .build();

        MySQLStatus {
            phase: Some(phase),
            observed_generation: generation,
            reason: reason.map(str::to_string),
            phase_started_at: self.phase_started_at(phase),
            conditions,
        }
    }

    /// Record `phase`; returns whether a write happened
    pub async fn set_phase(&self, phase: DatabasePhase, reason: Option<&str>) -> Result<bool> {
        let desired = self.desired(phase, reason);
        self.write(desired).await
    }

    /// Record `Failed`, adding a ValidationFailed condition for rejected specs
    pub async fn set_failed(&self, validation: bool, message: &str) -> Result<bool> {
        let mut desired = self.desired(DatabasePhase::Failed, Some(message));
        if validation {
            desired.conditions = ConditionBuilder::from_existing(
                desired.conditions,
                self.mysql.metadata.generation,
            )
            .set_condition(
                condition_types::VALIDATION_FAILED,
                condition_status::TRUE,
                "InvalidSpec",
                message,
            )
            .build();
        }
        self.write(desired).await
    }

    /// Record the Initialized condition alongside the current phase
    pub fn with_initialized(status: MySQLStatus, generation: Option<i64>, message: &str) -> MySQLStatus {
        let conditions = ConditionBuilder::from_existing(status.conditions, generation)
            .set_condition(
                condition_types::INITIALIZED,
                condition_status::TRUE,
                "InitSourceApplied",
                message,
            )
            .build();
        MySQLStatus {
            conditions,
            ..status
        }
    }

    pub async fn write(&self, desired: MySQLStatus) -> Result<bool> {
        let name = kube::ResourceExt::name_any(self.mysql);
        write_status(
            self.repo,
            self.ns,
            &name,
            self.mysql.status.as_ref(),
            &desired,
        )
        .await
    }

    /// Keep the existing timestamp while the phase is unchanged
    fn phase_started_at(&self, new_phase: DatabasePhase) -> Option<String> {
        let status = self.mysql.status.as_ref();
        let current_phase = status.and_then(|s| s.phase);
        let existing = status.and_then(|s| s.phase_started_at.clone());

        if current_phase == Some(new_phase) && existing.is_some() {
            existing
        } else {
            Some(Utc::now().to_rfc3339())
        }
    }
}

/// Whether the generation moved on since status was last written
pub fn spec_changed(mysql: &MySQL) -> bool {
    let current = mysql.metadata.generation;
    let observed = mysql.status.as_ref().and_then(|s| s.observed_generation);

    match (current, observed) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}

/// Seconds spent in the current phase, if the entry time is known
pub fn seconds_in_phase(mysql: &MySQL) -> Option<i64> {
    let started = mysql
        .status
        .as_ref()
        .and_then(|s| s.phase_started_at.as_deref())?;
    let started = chrono::DateTime::parse_from_rfc3339(started).ok()?;
    Some((Utc::now() - started.with_timezone(&Utc)).num_seconds())
}
