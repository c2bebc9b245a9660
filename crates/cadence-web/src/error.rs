//! Error types for the trigger endpoint.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use cadence_scheduler::{InvocationResponse, SchedulerError};
use thiserror::Error;
use tracing::error;

/// Errors that end an invocation before any post is processed.
#[derive(Debug, Error)]
pub enum WebError {
    /// Missing or wrong shared secret.
    #[error("unauthorized")]
    Unauthorized,

    /// The query string or body did not hold valid parameters.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The worker could not query the store.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl WebError {
    fn status(&self) -> StatusCode {
        match self {
            WebError::Unauthorized => StatusCode::UNAUTHORIZED,
            WebError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "worker invocation failed");
        }
        (status, Json(InvocationResponse::failure(self.to_string()))).into_response()
    }
}
