//! Error types for platform API calls.

use cadence_scheduler::{Provider, PublishError};
use thiserror::Error;

/// Errors that can occur when talking to a platform API.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The platform rejected the access token.
    #[error("unauthorized ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Non-success status from the platform.
    #[error("request failed ({status}): {body}")]
    Api { status: u16, body: String },

    /// The stored media could not be downloaded.
    #[error("media fetch failed: {0}")]
    Media(String),

    /// Successful status but unusable body.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The post's settings or media cannot be published to this platform.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl PlatformError {
    /// Classify for the worker. Token rejections become reconnect failures.
    pub fn into_publish_error(self, provider: Provider) -> PublishError {
        match self {
            PlatformError::Unauthorized { status, .. } => PublishError::not_connected(format!(
                "{} rejected the access token ({}). Please reconnect your account.",
                provider.display_name(),
                status
            )),
            other => PublishError::adapter(format!("{} {}", provider.display_name(), other)),
        }
    }
}
