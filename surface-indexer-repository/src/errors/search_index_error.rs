//! Search index error types.
//!
//! This module defines the unified error type for all search index operations,
//! including both low-level backend errors and request-level failures.

use thiserror::Error;

/// Unified errors from search index operations.
///
/// Used by the `SearchIndexProvider` trait for all search index operations.
/// [`SearchIndexError::is_transient`] separates failures worth retrying (the
/// engine was unreachable, overloaded or slow) from requests it rejected.
#[derive(Debug, Clone, Error)]
pub enum SearchIndexError {
    /// Validation error (e.g., empty index name, malformed alias action).
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Failed to reach the search index backend.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The request did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The backend answered with a retryable status (429, 502, 503, 504).
    #[error("Backend unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// Failed to create an index.
    #[error("Index creation error: {0}")]
    IndexCreationError(String),

    /// Failed to delete an index.
    #[error("Index deletion error: {0}")]
    IndexDeletionError(String),

    /// A bulk request was rejected as a whole.
    #[error("Bulk index error: {0}")]
    BulkIndexError(String),

    /// Failed to update index settings or refresh an index.
    #[error("Settings error: {0}")]
    SettingsError(String),

    /// Failed to read or change aliases.
    #[error("Alias error: {0}")]
    AliasError(String),

    /// Failed to start a snapshot.
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    /// Failed to parse response from search index backend.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to serialize data for the search index backend.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Batch size exceeds configured maximum.
    #[error("Batch size {provided} exceeds maximum {max}")]
    BatchSizeExceeded { provided: usize, max: usize },

    /// Unknown error.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SearchIndexError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an index creation error.
    pub fn index_creation(msg: impl Into<String>) -> Self {
        Self::IndexCreationError(msg.into())
    }

    /// Create an index deletion error.
    pub fn index_deletion(msg: impl Into<String>) -> Self {
        Self::IndexDeletionError(msg.into())
    }

    /// Create a bulk index error.
    pub fn bulk_index(msg: impl Into<String>) -> Self {
        Self::BulkIndexError(msg.into())
    }

    /// Create a settings error.
    pub fn settings(msg: impl Into<String>) -> Self {
        Self::SettingsError(msg.into())
    }

    /// Create an alias error.
    pub fn alias(msg: impl Into<String>) -> Self {
        Self::AliasError(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Create a batch size exceeded error.
    pub fn batch_size_exceeded(provided: usize, max: usize) -> Self {
        Self::BatchSizeExceeded { provided, max }
    }

    /// Create a snapshot error.
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::SnapshotError(msg.into())
    }

    /// Create an unknown error.
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Classify a non-success HTTP status.
    ///
    /// Retryable statuses become [`SearchIndexError::Unavailable`]; anything
    /// else is handed to `otherwise`.
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        otherwise: fn(String) -> Self,
    ) -> Self {
        let message = message.into();
        match status {
            429 | 502 | 503 | 504 => Self::Unavailable { status, message },
            _ => otherwise(format!("status {}: {}", status, message)),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::Timeout(_) | Self::Unavailable { .. }
        )
    }
}

impl From<opensearch::Error> for SearchIndexError {
    fn from(error: opensearch::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout(error.to_string());
        }
        match error.status_code() {
            Some(status) => Self::from_status(status.as_u16(), error.to_string(), Self::Unknown),
            None => Self::ConnectionError(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SearchIndexError::connection("refused").is_transient());
        assert!(SearchIndexError::timeout("60s").is_transient());
        assert!(
            SearchIndexError::from_status(429, "too many requests", SearchIndexError::BulkIndexError)
                .is_transient()
        );
        assert!(!SearchIndexError::from_status(400, "mapper_parsing_exception", SearchIndexError::BulkIndexError)
            .is_transient());
        assert!(!SearchIndexError::alias("missing index").is_transient());
    }

    #[test]
    fn test_from_status_uses_fallback_constructor() {
        let err = SearchIndexError::from_status(400, "bad body", SearchIndexError::IndexCreationError);
        assert!(matches!(err, SearchIndexError::IndexCreationError(ref m) if m.contains("400")));
    }
}
