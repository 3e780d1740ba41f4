//! Admission webhook policies
//!
//! Each policy module exports a `validate_*` function checking one group of
//! rules. MySQL policies share a [`ValidationContext`]; Snapshot and
//! DormantDatabase policies take their objects directly.

pub mod dormant;
pub mod env;
pub mod immutability;
pub mod init;
pub mod resume;
pub mod snapshot;
pub mod termination;

pub use dormant::validate_dormant;
pub use env::validate_env_vars;
pub use immutability::validate_immutability;
pub use init::validate_init_source;
pub use resume::validate_resume;
pub use snapshot::{SnapshotValidationContext, validate_snapshot_request};
pub use termination::{validate_delete, validate_termination_policy};

use crate::controller::Error;
use crate::controller::validation::validate_mysql;
use crate::crd::{DormantDatabase, MySQL, Snapshot};

/// Result of a policy validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }

    /// Deny with the message of a validation error
    pub fn from_error(reason: &str, error: &Error) -> Self {
        let message = match error {
            Error::ValidationError(message) => message.clone(),
            other => other.to_string(),
        };
        Self::denied(reason, &message)
    }
}

/// Context for MySQL validation
///
/// `dormant` and `source_snapshot` are looked up by the handler: the
/// DormantDatabase sharing the database's name, and the snapshot named by
/// `spec.init.snapshotSource`.
pub struct ValidationContext<'a> {
    pub mysql: &'a MySQL,
    pub old_mysql: Option<&'a MySQL>,
    pub dormant: Option<&'a DormantDatabase>,
    pub source_snapshot: Option<&'a Snapshot>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(mysql: &'a MySQL, old_mysql: Option<&'a MySQL>) -> Self {
        Self {
            mysql,
            old_mysql,
            dormant: None,
            source_snapshot: None,
        }
    }

    pub fn with_dormant(mut self, dormant: Option<&'a DormantDatabase>) -> Self {
        self.dormant = dormant;
        self
    }

    pub fn with_source_snapshot(mut self, snapshot: Option<&'a Snapshot>) -> Self {
        self.source_snapshot = snapshot;
        self
    }

    /// Check if this is a CREATE operation (no old object)
    pub fn is_create(&self) -> bool {
        self.old_mysql.is_none()
    }
}

/// Field-level rules shared with the reconciler
pub fn validate_spec(ctx: &ValidationContext) -> ValidationResult {
    match validate_mysql(ctx.mysql) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("InvalidSpec", &e),
    }
}

/// Run all MySQL policies and return the first failure
pub fn validate_all(ctx: &ValidationContext) -> ValidationResult {
    // Specific policies first so their reasons win over the generic spec check.
    let policies: Vec<fn(&ValidationContext) -> ValidationResult> = vec![
        validate_termination_policy,
        validate_env_vars,
        validate_init_source,
        validate_resume,
        validate_immutability,
        validate_spec,
    ];

    for policy in policies {
        let result = policy(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
