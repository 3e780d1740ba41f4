//! Environment policies
//!
//! Root credential variables belong to the operator and are rejected.
//! Everything else, `MYSQL_DATABASE` included, may be set and changed freely.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_env;

pub fn validate_env_vars(ctx: &ValidationContext) -> ValidationResult {
    match validate_env(&ctx.mysql.spec.pod_template.env) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("ForbiddenEnvVar", &e),
    }
}
