//! Snapshot policies
//!
//! - Backend and job volume rules
//! - The source database must exist, and only one snapshot per database may
//!   be in flight
//! - A snapshot's spec can't change after creation

use super::ValidationResult;
use crate::controller::validation::{validate_snapshot, validate_snapshot_update};
use crate::crd::{MySQL, Snapshot};

pub struct SnapshotValidationContext<'a> {
    pub snapshot: &'a Snapshot,
    pub old_snapshot: Option<&'a Snapshot>,
    pub database: Option<&'a MySQL>,
    /// Other snapshots of the same database
    pub siblings: &'a [Snapshot],
}

pub fn validate_snapshot_request(ctx: &SnapshotValidationContext) -> ValidationResult {
    if let Some(old) = ctx.old_snapshot {
        return match validate_snapshot_update(old, ctx.snapshot) {
            Ok(()) => ValidationResult::allowed(),
            Err(e) => ValidationResult::from_error("ImmutableField", &e),
        };
    }

    if let Err(e) = validate_snapshot(ctx.snapshot) {
        return ValidationResult::from_error("InvalidSnapshot", &e);
    }
    let db_name = &ctx.snapshot.spec.database_name;
    if ctx.database.is_none() {
        return ValidationResult::denied(
            "DatabaseNotFound",
            &format!("MySQL {db_name} does not exist"),
        );
    }
    let own_name = kube::ResourceExt::name_any(ctx.snapshot);
    if let Some(running) = ctx
        .siblings
        .iter()
        .find(|s| {
            s.spec.database_name == *db_name
                && s.is_in_flight()
                && kube::ResourceExt::name_any(*s) != own_name
        })
    {
        return ValidationResult::denied(
            "SnapshotInProgress",
            &format!(
                "snapshot {} of {db_name} is still running",
                kube::ResourceExt::name_any(running)
            ),
        );
    }
    ValidationResult::allowed()
}
