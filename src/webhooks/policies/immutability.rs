//! Immutability policies
//!
//! Storage, topology, init source and an explicit credential secret are
//! fixed once the database exists.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_mysql_update;

pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    // Only apply immutability checks on UPDATE, not CREATE
    let Some(old) = ctx.old_mysql else {
        return ValidationResult::allowed();
    };
    match validate_mysql_update(old, ctx.mysql) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("ImmutableField", &e),
    }
}
