//! Admission webhooks for MySQL, Snapshot and DormantDatabase validation
//!
//! Rejects objects the reconciler could never act on before they are
//! persisted: conflicting termination and storage settings, ambiguous init
//! sources, credential drift on resume, operator-owned environment variables,
//! and deletion of `DoNotTerminate` databases.

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{
    AdmissionRequest, AdmissionReview, AdmissionReviewResponse, WEBHOOK_CERT_DIR, WEBHOOK_PORT,
    WebhookError, create_response, create_webhook_router, review_dormant, review_mysql,
    review_snapshot, run_webhook_server,
};
