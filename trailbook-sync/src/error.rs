//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The operation did not finish in time.
    #[error("operation timed out")]
    Timeout,

    /// The backend is reachable but the target collection does not exist.
    #[error("collection {collection} does not exist on the backend")]
    SchemaMissing { collection: String },

    /// No usable backend integration (missing URL, rejected credentials).
    #[error("backend not configured: {0}")]
    NotConfigured(String),

    /// The backend refused the request for a reason retrying will not fix.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The record does not exist remotely.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A payload could not be turned into a record or change event.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] trailbook_types::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The coordinator was disposed.
    #[error("sync coordinator disposed")]
    Disposed,
}

/// How a failed write or check should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Backend integration present but unusable for this collection.
    /// Degrade to local-only for it.
    Configuration,
    /// Connectivity problem. Keep the change locally; it reconciles later.
    Transient,
    /// Anything else. Surface to the caller unchanged.
    Fatal,
}

impl SyncError {
    /// Classifies this error for the local-fallback write path.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::SchemaMissing { .. } | SyncError::NotConfigured(_) => {
                FailureKind::Configuration
            }
            SyncError::Network(_) | SyncError::Timeout => FailureKind::Transient,
            SyncError::Rejected { status, .. } if *status == 429 || *status >= 500 => {
                FailureKind::Transient
            }
            _ => FailureKind::Fatal,
        }
    }

    /// Shorthand for `failure_kind() == Configuration`.
    pub fn is_configuration(&self) -> bool {
        self.failure_kind() == FailureKind::Configuration
    }

    /// Shorthand for `failure_kind() == Transient`.
    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}
