//! Init source policies
//!
//! - At most one init mode per database
//! - A snapshot source must have been taken with the credentials the new
//!   database will use, unless the database resumes data it already restored

use super::{ValidationContext, ValidationResult};
use crate::controller::dormant::restores_initialized_data;
use crate::controller::validation::validate_init;
use crate::crd::SnapshotPhase;

pub fn validate_init_source(ctx: &ValidationContext) -> ValidationResult {
    let Some(init) = &ctx.mysql.spec.init else {
        return ValidationResult::allowed();
    };
    if let Err(e) = validate_init(init) {
        return ValidationResult::from_error("InvalidInitSource", &e);
    }

    // Already-initialized databases never look at the source again.
    if !ctx.is_create() || ctx.dormant.is_some_and(restores_initialized_data) {
        return ValidationResult::allowed();
    }
    let Some(source) = &init.snapshot_source else {
        return ValidationResult::allowed();
    };
    let Some(snapshot) = ctx.source_snapshot else {
        return ValidationResult::denied(
            "SnapshotNotFound",
            &format!("init snapshot {} does not exist", source.name),
        );
    };
    if snapshot.phase() == Some(SnapshotPhase::Failed) {
        return ValidationResult::denied(
            "SnapshotFailed",
            &format!("init snapshot {} failed and cannot be restored", source.name),
        );
    }

    let Some(secret) = &ctx.mysql.spec.database_secret else {
        return ValidationResult::denied(
            "SnapshotSecretMismatch",
            "spec.databaseSecret must name the source database's secret when initializing from a snapshot",
        );
    };
    let recorded = snapshot
        .status
        .as_ref()
        .and_then(|s| s.database_secret_name.as_deref());
    match recorded {
        Some(recorded) if recorded != secret.secret_name => ValidationResult::denied(
            "SnapshotSecretMismatch",
            &format!(
                "spec.databaseSecret {} does not match secret {} of snapshot {}",
                secret.secret_name, recorded, source.name
            ),
        ),
        // Not recorded until the backup starts; the reconciler re-checks later.
        _ => ValidationResult::allowed(),
    }
}
