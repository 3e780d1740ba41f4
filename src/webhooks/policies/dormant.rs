//! DormantDatabase policies
//!
//! The origin is a record of what was archived and never changes; wipe-out
//! can be requested but not withdrawn.

use super::ValidationResult;
use crate::controller::validation::validate_dormant_update;
use crate::crd::DormantDatabase;

pub fn validate_dormant(new: &DormantDatabase, old: Option<&DormantDatabase>) -> ValidationResult {
    let Some(old) = old else {
        return ValidationResult::allowed();
    };
    match validate_dormant_update(old, new) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("ImmutableField", &e),
    }
}
