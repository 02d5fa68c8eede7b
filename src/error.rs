use thiserror::Error;

/// Unified error type for the entire crate.
///
/// Each variant represents one category from the error taxonomy: usage
/// errors (malformed calls), validation errors (schema mismatches),
/// not-found errors (reads that expected data to exist), and storage errors
/// surfaced verbatim from the adapter boundary.
#[derive(Error, Debug)]
pub enum DataTreeError {
    /// A call was malformed: missing record, missing `type`/`id`, a filter
    /// set twice, or an id and a filter set on the same query.
    #[error("Usage error: {0}")]
    Usage(String),

    /// A record did not match its type schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced id, type, or field configuration was absent when an
    /// operation expected it to exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error reported by the storage adapter.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Errors related to serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DataTreeError {
    fn from(error: serde_json::Error) -> Self {
        DataTreeError::Serialization(error.to_string())
    }
}

impl From<sled::Error> for DataTreeError {
    fn from(error: sled::Error) -> Self {
        DataTreeError::Storage(error.to_string())
    }
}

/// Result type alias for operations that can result in a [`DataTreeError`].
pub type DataTreeResult<T> = Result<T, DataTreeError>;
