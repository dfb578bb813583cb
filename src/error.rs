//! Error types for the snapshot store.

use std::time::Duration;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot already exists: {0}")]
    DuplicateId(String),

    #[error("Schema validation failed at `{path}`: {reason}")]
    SchemaValidationFailed { path: String, reason: String },

    #[error("Batch rejected at item {index}: {source}")]
    BatchPartialFailure {
        index: usize,
        source: Box<StoreError>,
    },

    #[error("Delivery to subscriber {subscriber} failed: {reason}")]
    SubscriberDeliveryFailed { subscriber: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Snapshot limit of {limit} reached")]
    SnapshotLimitExceeded { limit: usize },

    #[error("Snapshot store not found: {0}")]
    StoreNotFound(String),

    #[error("Snapshot store already exists: {0}")]
    StoreExists(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Collaborator call failed: {0}")]
    Collaborator(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    pub(crate) fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::SchemaValidationFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for `NotFound`, including a batch rejected because of one.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::BatchPartialFailure { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_message_includes_path() {
        let err = StoreError::schema("items[2].price", "expected number, got string");
        assert_eq!(
            err.to_string(),
            "Schema validation failed at `items[2].price`: expected number, got string"
        );
    }

    #[test]
    fn test_batch_failure_wraps_not_found() {
        let err = StoreError::BatchPartialFailure {
            index: 3,
            source: Box::new(StoreError::NotFound("s9".into())),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("item 3"));
    }
}
