//! Error types for the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in scheduler operations.
///
/// These are invocation-level failures. Per-post failures are carried by
/// [`PublishError`] and persisted on the post instead of being propagated.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Post already exists.
    #[error("post already exists: {0}")]
    PostExists(String),

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The store is unusable (poisoned lock, closed connection).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Classification of a per-post failure.
///
/// Persisted next to `last_error` so notification routing does not have to
/// guess from the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The referenced upload does not exist.
    AssetMissing,
    /// Platform credentials are missing or unusable; the user must reconnect.
    AccountNotConnected,
    /// The publish adapter raised an error.
    AdapterFailure,
    /// A two-phase publish exceeded its processing deadline.
    AsyncProcessingTimeout,
    /// The provider reported that processing failed.
    AsyncProcessingError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AssetMissing => "asset_missing",
            ErrorKind::AccountNotConnected => "account_not_connected",
            ErrorKind::AdapterFailure => "adapter_failure",
            ErrorKind::AsyncProcessingTimeout => "async_processing_timeout",
            ErrorKind::AsyncProcessingError => "async_processing_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asset_missing" => Some(ErrorKind::AssetMissing),
            "account_not_connected" => Some(ErrorKind::AccountNotConnected),
            "adapter_failure" => Some(ErrorKind::AdapterFailure),
            "async_processing_timeout" => Some(ErrorKind::AsyncProcessingTimeout),
            "async_processing_error" => Some(ErrorKind::AsyncProcessingError),
            _ => None,
        }
    }

    /// Whether this kind asks the owner to reconnect their account.
    pub fn is_reconnect(&self) -> bool {
        matches!(self, ErrorKind::AccountNotConnected)
    }
}

/// A per-post failure: a kind plus the message recorded as `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PublishError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PublishError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn asset_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AssetMissing, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccountNotConnected, message)
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AdapterFailure, message)
    }

    pub fn processing_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AsyncProcessingTimeout, message)
    }

    pub fn processing_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AsyncProcessingError, message)
    }
}
