//! Web routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::HeaderMap,
    routing::get,
};
use cadence_scheduler::{InvocationRequest, InvocationResponse, Worker};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::WebError;

/// Shared state for the web server.
pub struct AppState {
    pub worker: Worker,
    /// Shared secret callers must present. An empty secret rejects every call.
    pub cron_secret: String,
}

/// Create the web router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/worker/run", get(run_get).post(run_post))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn run_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<InvocationRequest>, QueryRejection>,
) -> Result<Json<InvocationResponse>, WebError> {
    authorize(&state, &headers)?;
    invoke(&state, query_params(query)?).await
}

async fn run_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<InvocationRequest>, QueryRejection>,
    body: Bytes,
) -> Result<Json<InvocationResponse>, WebError> {
    authorize(&state, &headers)?;
    let query = query_params(query)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        query
    } else {
        let from_body: InvocationRequest =
            serde_json::from_slice(&body).map_err(|e| WebError::BadRequest(e.to_string()))?;
        merge(query, from_body)
    };
    invoke(&state, request).await
}

async fn invoke(
    state: &AppState,
    request: InvocationRequest,
) -> Result<Json<InvocationResponse>, WebError> {
    let response = state.worker.run(&request).await?;
    info!(
        processed = response.processed,
        job_id = request.job_id.as_deref(),
        "worker invocation finished"
    );
    Ok(Json(response))
}

/// Query parameters are only inspected after the caller is authorized.
fn query_params(
    query: Result<Query<InvocationRequest>, QueryRejection>,
) -> Result<InvocationRequest, WebError> {
    query
        .map(|Query(request)| request)
        .map_err(|e| WebError::BadRequest(e.body_text()))
}

/// Body parameters win over query parameters; flags are enabled by either.
fn merge(query: InvocationRequest, body: InvocationRequest) -> InvocationRequest {
    InvocationRequest {
        job_id: body.job_id.or(query.job_id),
        retry_failed: body.retry_failed || query.retry_failed,
        debug: body.debug || query.debug,
        upload_id: body.upload_id.or(query.upload_id),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), WebError> {
    let presented = bearer_token(headers).or_else(|| cron_secret_header(headers));
    match presented {
        Some(secret)
            if !state.cron_secret.is_empty()
                && constant_time_eq(secret.as_bytes(), state.cron_secret.as_bytes()) =>
        {
            Ok(())
        }
        _ => {
            warn!("rejected worker trigger with a missing or wrong secret");
            Err(WebError::Unauthorized)
        }
    }
}

/// Compare secrets without exiting early on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("Authorization")?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?;
    if token.trim().is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn cron_secret_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-cron-secret")?.to_str().ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    Some(raw.to_string())
}
