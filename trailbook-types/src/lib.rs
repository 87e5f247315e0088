//! Core type definitions for Trailbook sync.
//!
//! This crate defines the backend-agnostic types shared by the sync layer
//! and its callers:
//! - Record and collection identifiers
//! - The opaque `Record` shape (an id plus JSON fields)
//! - Change events, both as raw backend payloads and as the closed
//!   `ChangeEvent` variant type
//!
//! What a journal entry or a map pin looks like is the app's business, not
//! this crate's.

mod event;
mod ids;
mod record;

pub use event::{ChangeEvent, ChangeKind, RawChange, REFRESH_MARKER};
pub use ids::{Collection, RecordId, LOCAL_ID_PREFIX};
pub use record::Record;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("invalid change event: {0}")]
    InvalidChange(String),
}
