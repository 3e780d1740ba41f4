//! Termination policies
//!
//! - `DoNotTerminate` databases can't be deleted
//! - `Pause` needs durable storage to have anything to resume from

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_termination;
use crate::crd::{MySQL, TerminationPolicy};

pub fn validate_termination_policy(ctx: &ValidationContext) -> ValidationResult {
    let spec = &ctx.mysql.spec;
    match validate_termination(spec.storage_type, spec.termination_policy) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("PauseRequiresDurableStorage", &e),
    }
}

/// Decide a DELETE request against the stored object
pub fn validate_delete(mysql: &MySQL) -> ValidationResult {
    if mysql.spec.termination_policy == TerminationPolicy::DoNotTerminate {
        return ValidationResult::denied(
            "DeletionBlocked",
            &format!(
                "MySQL {} has terminationPolicy DoNotTerminate. \
                 Change the policy before deleting it.",
                kube::ResourceExt::name_any(mysql)
            ),
        );
    }
    ValidationResult::allowed()
}
