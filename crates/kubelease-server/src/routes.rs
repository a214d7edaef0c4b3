//! HTTP routes
//!
//! - `GET  /v1/config` → stored configuration, admin credential redacted
//!   unless `?raw=true`
//! - `POST /v1/config` → validate and replace the configuration
//! - `GET  /v1/service_account/{namespace}/{tier}?ttl=N` → issue a lease
//! - `POST /v1/revoke` → revoke a lease from its descriptor
//! - `GET  /healthz`
//!
//! Issuance and revocation run on their own task. If the HTTP client goes
//! away mid-request the task sees a cancellation rather than being dropped,
//! so it still rolls back whatever it already created.

use std::future::Future;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use kubelease_engine::context::DEFAULT_CALL_TIMEOUT;
use kubelease_engine::{
    ttl, Backend, ConfigRecord, LeaseDescriptor, LeaseOptions, RequestContext, RevocationTarget,
};

use crate::error::ApiError;

const ISSUE_PATH_HELP: &str =
    "expected path /v1/service_account/<namespace>/<tier>, e.g. /v1/service_account/team-a/viewer";

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Engine facade
    pub backend: Backend,
    /// Upper bound on each remote call made for a request
    pub call_timeout: Duration,
}

impl AppState {
    /// State with the default per-call timeout
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/config", get(read_config).post(write_config))
        .route("/v1/service_account", get(missing_issue_params))
        .route("/v1/service_account/{namespace}", get(missing_issue_params))
        .route("/v1/service_account/{namespace}/{tier}", get(issue))
        .route("/v1/revoke", post(revoke))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ReadConfigQuery {
    #[serde(default)]
    raw: bool,
}

async fn read_config(
    State(state): State<AppState>,
    Query(query): Query<ReadConfigQuery>,
) -> Result<Json<ConfigRecord>, ApiError> {
    let record = if query.raw {
        state.backend.read_config_raw().await?
    } else {
        state.backend.read_config().await?
    };
    record
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("backend is not configured".to_string()))
}

async fn write_config(
    State(state): State<AppState>,
    Json(record): Json<ConfigRecord>,
) -> Result<StatusCode, ApiError> {
    state.backend.configure(&record).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct IssueQuery {
    #[serde(default)]
    ttl: Option<String>,
}

/// Issuance response: the lease plus the host's bookkeeping
#[derive(Debug, Serialize)]
pub struct IssueResponse {
    /// Lease descriptor to present back on revocation
    pub data: LeaseDescriptor,
    /// Lease lifetime and renewability
    pub lease: LeaseOptions,
}

async fn issue(
    State(state): State<AppState>,
    Path((namespace, tier)): Path<(String, String)>,
    Query(query): Query<IssueQuery>,
) -> Result<Json<IssueResponse>, ApiError> {
    let ttl_seconds = ttl::parse(query.ttl.as_deref().unwrap_or(""))?;
    let backend = state.backend.clone();

    let lease = run_detached(state.call_timeout, move |ctx| async move {
        backend
            .issue_credential(&ctx, &tier, &namespace, ttl_seconds)
            .await
    })
    .await?;

    Ok(Json(IssueResponse {
        lease: lease.lease_options(),
        data: lease,
    }))
}

async fn missing_issue_params() -> ApiError {
    ApiError::BadRequest(ISSUE_PATH_HELP.to_string())
}

async fn revoke(
    State(state): State<AppState>,
    Json(target): Json<RevocationTarget>,
) -> Result<StatusCode, ApiError> {
    let backend = state.backend.clone();
    run_detached(state.call_timeout, move |ctx| async move {
        backend.revoke_credential(&ctx, &target).await
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run engine work on its own task, cancelling it if this request is dropped
async fn run_detached<T, F, Fut>(call_timeout: Duration, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(RequestContext) -> Fut,
    Fut: Future<Output = kubelease_common::Result<T>> + Send + 'static,
{
    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let ctx = RequestContext::with_cancellation(token).with_call_timeout(call_timeout);

    tokio::spawn(work(ctx))
        .await
        .map_err(|e| ApiError::Internal(format!("request task failed: {}", e)))?
        .map_err(ApiError::from)
}
