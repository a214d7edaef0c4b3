//! Error types for the server

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use kubelease_common::telemetry::TelemetryError;
use kubelease_common::Error as CoreError;

/// Server Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Startup and serving failures
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Telemetry could not be initialized
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Backend construction failed
    #[error("backend error: {0}")]
    Backend(#[from] CoreError),

    /// Local cluster client for secret storage could not be created
    #[error("local cluster client error: {0}")]
    LocalClient(#[from] kube::Error),

    /// The listen address could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address requested
        addr: SocketAddr,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The HTTP server stopped with an error
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Error returned by an HTTP handler
#[derive(Debug)]
pub enum ApiError {
    /// Failure reported by the engine
    Core(CoreError),
    /// Request was malformed before reaching the engine
    BadRequest(String),
    /// Nothing to return
    NotFound(String),
    /// The handler's worker task failed
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

/// HTTP status for an engine error, decided by its root cause
pub fn status_for(err: &CoreError) -> StatusCode {
    match err.root_cause() {
        CoreError::Configuration { .. }
        | CoreError::TierNotAllowed { .. }
        | CoreError::InvalidTtl { .. }
        | CoreError::InvalidLease { .. } => StatusCode::BAD_REQUEST,
        CoreError::RemoteResource {
            status: Some(404), ..
        } => StatusCode::NOT_FOUND,
        CoreError::RemoteResource { .. } | CoreError::MultipleSecrets { .. } => {
            StatusCode::BAD_GATEWAY
        }
        CoreError::PropagationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Cancelled {
            timed_out: true, ..
        } => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Storage { .. } | CoreError::Issuance(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reason_for(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::BAD_GATEWAY => "BadGateway",
        StatusCode::GATEWAY_TIMEOUT => "Timeout",
        StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable",
        _ => "InternalError",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, details) = match &self {
            ApiError::Core(err) => {
                let details = err.compensation().map(|report| {
                    json!({
                        "failedStep": err.failed_step().map(|s| s.to_string()),
                        "rollbackClean": report.is_clean(),
                        "remaining": report
                            .remaining()
                            .iter()
                            .map(|r| r.to_string())
                            .collect::<Vec<_>>(),
                    })
                });
                (status_for(err), err.to_string(), details)
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), None),
        };

        // K8s-style Status response
        let mut body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "reason": reason_for(status),
            "code": status.as_u16()
        });
        if let Some(details) = details {
            body["details"] = details;
        }

        (status, axum::Json(body)).into_response()
    }
}
