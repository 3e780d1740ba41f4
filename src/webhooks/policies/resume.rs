//! Resume policies
//!
//! Creating a MySQL that shares its name with a DormantDatabase resumes the
//! archived data, so the credentials must be the ones the data was written
//! with.

use super::{ValidationContext, ValidationResult};
use crate::crd::{DormantPhase, effective_secret_name};

pub fn validate_resume(ctx: &ValidationContext) -> ValidationResult {
    if !ctx.is_create() {
        return ValidationResult::allowed();
    }
    let Some(dormant) = ctx.dormant else {
        return ValidationResult::allowed();
    };

    if dormant.spec.wipe_out || dormant.phase() == Some(DormantPhase::WipedOut) {
        return ValidationResult::denied(
            "DormantWipedOut",
            &format!(
                "DormantDatabase {} is being wiped out. Wait for it to disappear before reusing the name.",
                dormant.spec.origin.metadata.name
            ),
        );
    }

    let origin = &dormant.spec.origin;
    let recorded = effective_secret_name(&origin.spec.mysql, &origin.metadata.name);
    let requested = ctx.mysql.secret_name();
    if recorded != requested {
        return ValidationResult::denied(
            "CredentialDrift",
            &format!(
                "resuming {} requires secret {recorded}, got {requested}",
                origin.metadata.name
            ),
        );
    }

    ValidationResult::allowed()
}
