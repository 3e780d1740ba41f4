//! Webhook HTTP server handlers
//!
//! Implements the ValidatingAdmissionWebhook endpoints for MySQL, Snapshot
//! and DormantDatabase resources. Lookups go through the same repositories
//! the controllers use, so the handlers run unchanged against the in-memory
//! store in tests.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::policies::{
    SnapshotValidationContext, ValidationContext, ValidationResult, validate_all, validate_delete,
    validate_dormant, validate_snapshot_request,
};
use crate::crd::{DormantDatabase, MySQL, Snapshot};
use crate::store::{Repositories, Selector};

/// Kubernetes AdmissionReview request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub object: Option<serde_json::Value>,
    #[serde(default)]
    pub old_object: Option<serde_json::Value>,
}

/// AdmissionReview response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared state for webhook handlers
pub(crate) struct WebhookState {
    pub repos: Repositories,
}

/// Create the webhook router
pub fn create_webhook_router(repos: Repositories) -> Router {
    Router::new()
        .route("/validate-mysql", post(validate_mysql_handler))
        .route("/validate-snapshot", post(validate_snapshot_handler))
        .route("/validate-dormantdatabase", post(validate_dormant_handler))
        .with_state(Arc::new(WebhookState { repos }))
}

async fn validate_mysql_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    respond("MySQL", review, |request| review_mysql(&state.repos, request)).await
}

async fn validate_snapshot_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    respond("Snapshot", review, |request| review_snapshot(&state.repos, request)).await
}

async fn validate_dormant_handler(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    respond("DormantDatabase", review, |request| async move {
        review_dormant(request)
    })
    .await
}

/// Unwrap the review, run `review` on the request and wrap the verdict
async fn respond<F, Fut>(
    kind: &str,
    review: AdmissionReview,
    check: F,
) -> (StatusCode, Json<AdmissionReviewResponse>)
where
    F: FnOnce(AdmissionRequest) -> Fut,
    Fut: std::future::Future<Output = ValidationResult>,
{
    let Some(request) = review.request else {
        error!("Admission review missing request");
        return (
            StatusCode::BAD_REQUEST,
            Json(create_response(
                "",
                false,
                "Missing request in AdmissionReview",
                None,
            )),
        );
    };

    let uid = request.uid.clone();
    info!(
        uid = %uid,
        kind,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    let result = check(request).await;
    if !result.allowed {
        let reason = result
            .reason
            .unwrap_or_else(|| "ValidationFailed".to_string());
        let message = result
            .message
            .unwrap_or_else(|| "Validation failed".to_string());
        warn!(uid = %uid, kind, reason = %reason, message = %message, "Admission request denied");
        return (
            StatusCode::OK,
            Json(create_response(&uid, false, &message, Some(&reason))),
        );
    }

    info!(uid = %uid, kind, "Admission request allowed");
    (StatusCode::OK, Json(create_response(&uid, true, "", None)))
}

fn parse<K: DeserializeOwned>(value: Option<&serde_json::Value>) -> Result<Option<K>, ValidationResult> {
    value
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()
        .map_err(|e| {
            ValidationResult::denied("InvalidObject", &format!("Failed to parse object: {e}"))
        })
}

fn request_namespace(request: &AdmissionRequest) -> String {
    request
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

/// Decide a MySQL admission request
pub async fn review_mysql(repos: &Repositories, request: AdmissionRequest) -> ValidationResult {
    if request.operation == "DELETE" {
        return match parse::<MySQL>(request.old_object.as_ref()) {
            Ok(Some(old)) => validate_delete(&old),
            // Without the stored object there's nothing to protect.
            Ok(None) => ValidationResult::allowed(),
            Err(denied) => denied,
        };
    }

    let mysql = match parse::<MySQL>(request.object.as_ref()) {
        Ok(Some(mysql)) => mysql,
        Ok(None) => return ValidationResult::denied("InvalidObject", "Missing object in request"),
        Err(denied) => return denied,
    };
    let old_mysql = match parse::<MySQL>(request.old_object.as_ref()) {
        Ok(old) => old,
        Err(_) => {
            warn!(uid = %request.uid, "Failed to parse old MySQL, treating as CREATE");
            None
        }
    };

    let ns = request_namespace(&request);
    let name = kube::ResourceExt::name_any(&mysql);
    let (dormant, source_snapshot) = if old_mysql.is_none() {
        (
            lookup(repos.dormant_databases.get(&ns, &name).await, "DormantDatabase", &ns, &name),
            match mysql
                .spec
                .init
                .as_ref()
                .and_then(|i| i.snapshot_source.as_ref())
            {
                Some(source) => {
                    let snap_ns = source.namespace.clone().unwrap_or_else(|| ns.clone());
                    lookup(
                        repos.snapshots.get(&snap_ns, &source.name).await,
                        "Snapshot",
                        &snap_ns,
                        &source.name,
                    )
                }
                None => None,
            },
        )
    } else {
        (None, None)
    };

    let ctx = ValidationContext::new(&mysql, old_mysql.as_ref())
        .with_dormant(dormant.as_ref())
        .with_source_snapshot(source_snapshot.as_ref());
    validate_all(&ctx)
}

/// Decide a Snapshot admission request
pub async fn review_snapshot(repos: &Repositories, request: AdmissionRequest) -> ValidationResult {
    if request.operation == "DELETE" {
        return ValidationResult::allowed();
    }
    let snapshot = match parse::<Snapshot>(request.object.as_ref()) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return ValidationResult::denied("InvalidObject", "Missing object in request"),
        Err(denied) => return denied,
    };
    let old_snapshot = parse::<Snapshot>(request.old_object.as_ref()).unwrap_or_default();

    let ns = request_namespace(&request);
    let db_name = snapshot.spec.database_name.clone();
    let (database, siblings) = if old_snapshot.is_none() {
        let database = lookup(repos.mysqls.get(&ns, &db_name).await, "MySQL", &ns, &db_name);
        let siblings = match repos.snapshots.list(&ns, &Selector::new()).await {
            Ok(all) => all,
            Err(e) => {
                warn!(namespace = %ns, error = %e, "Failed to list snapshots, skipping concurrency check");
                Vec::new()
            }
        };
        (database, siblings)
    } else {
        (None, Vec::new())
    };

    validate_snapshot_request(&SnapshotValidationContext {
        snapshot: &snapshot,
        old_snapshot: old_snapshot.as_ref(),
        database: database.as_ref(),
        siblings: &siblings,
    })
}

/// Decide a DormantDatabase admission request
pub fn review_dormant(request: AdmissionRequest) -> ValidationResult {
    if request.operation == "DELETE" {
        return ValidationResult::allowed();
    }
    let dormant = match parse::<DormantDatabase>(request.object.as_ref()) {
        Ok(Some(dormant)) => dormant,
        Ok(None) => return ValidationResult::denied("InvalidObject", "Missing object in request"),
        Err(denied) => return denied,
    };
    let old = parse::<DormantDatabase>(request.old_object.as_ref()).unwrap_or_default();
    validate_dormant(&dormant, old.as_ref())
}

/// Fail open on lookup errors; the reconciler repeats every check
fn lookup<K>(
    result: crate::controller::Result<Option<K>>,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Option<K> {
    result.unwrap_or_else(|e| {
        warn!(kind, namespace = %namespace, name = %name, error = %e, "Lookup failed, allowing");
        None
    })
}

/// Create an AdmissionReview response
pub fn create_response(
    uid: &str,
    allowed: bool,
    message: &str,
    reason: Option<&str>,
) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: 403,
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
        },
    }
}

/// Default directory holding `tls.crt` and `tls.key`
pub const WEBHOOK_CERT_DIR: &str = "/etc/webhook/certs";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:`port`. Certificates are PEM files loaded once at start.
pub async fn run_webhook_server(
    repos: Repositories,
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
    port: u16,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;

    let app = create_webhook_router(repos);

    let config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Webhook server error: {0}")]
    Server(String),
}
