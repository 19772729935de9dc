//! Storage-specific error types.
//!
//! All store operations report failures as [`StoreError`]. Transient variants
//! (transport, timeout) are meant to be retried by the caller; configuration
//! and validation failures are not.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Required connection parameters are missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network, connection or database failure (sqlx error).
    #[error("transport error: {0}")]
    Transport(#[from] sqlx::Error),

    /// A stored or incoming record failed schema validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation exceeded its time bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Whether the failure is a fatal configuration problem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Run `fut`, failing with [`StoreError::Timeout`] once `limit` elapses.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
