//! Error types surfaced by bucket operations
//!
//! Store collaborators speak `std::io::Error`; this module maps those into
//! the caller-facing taxonomy. `ListingFailure` only ever reaches the log.

use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

/// Result alias for bucket operations
pub type BucketResult<T> = Result<T, BucketError>;

#[derive(Error, Debug)]
pub enum BucketError {
    /// Whole-object write target is already present
    #[error("Object already exists: {key}")]
    AlreadyExists { key: String },

    /// Read target is absent
    #[error("Object not found: {key}")]
    NotFound { key: String },

    /// Stored content is not valid JSON for the requested type
    #[error("Failed to decode object {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be encoded before writing
    #[error("Failed to encode object {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Multipart upload failed; the session was aborted before returning
    #[error("Multipart transfer of {key} failed (upload {upload_id}): {source}")]
    TransferFailure {
        key: String,
        upload_id: String,
        #[source]
        source: IoError,
    },

    /// Bucket listing failed during a poll cycle
    #[error("Listing failed: {0}")]
    ListingFailure(#[source] IoError),

    /// Any other store error
    #[error("Object store error: {0}")]
    Store(#[from] IoError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BucketError {
    /// Map a store error for `key`, turning a missing object into `NotFound`
    pub fn from_store(key: &str, err: IoError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => BucketError::NotFound {
                key: key.to_string(),
            },
            _ => BucketError::Store(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BucketError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BucketError::AlreadyExists { .. })
    }
}
