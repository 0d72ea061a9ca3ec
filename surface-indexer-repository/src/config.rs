//! Configuration types for the search index provider.

use std::time::Duration;

/// Configuration for bulk requests sent to the search index backend.
///
/// Caps the number of documents per bulk request so that a misconfigured batch
/// size cannot produce requests above the engine's payload limit.
#[derive(Debug, Clone)]
pub struct BulkRequestConfig {
    /// Maximum number of documents allowed in a single bulk request.
    ///
    /// Set to `None` to disable the limit (not recommended for production).
    /// Defaults to 5000 if not specified.
    pub max_batch_size: Option<usize>,

    /// Transport-level timeout for a single request.
    pub request_timeout: Duration,
}

impl Default for BulkRequestConfig {
    fn default() -> Self {
        Self {
            max_batch_size: Some(5000),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl BulkRequestConfig {
    /// Create a config with no batch size limit.
    ///
    /// # Warning
    ///
    /// Removing batch size limits can lead to requests the engine rejects as too
    /// large. Not recommended for production.
    pub fn unlimited() -> Self {
        Self {
            max_batch_size: None,
            ..Self::default()
        }
    }

    /// Create a config with a custom batch size limit.
    ///
    /// # Arguments
    ///
    /// * `max_batch_size` - Maximum number of documents allowed in a single bulk request
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: Some(max_batch_size),
            ..Self::default()
        }
    }

    /// Check a batch against the configured limit.
    pub fn allows(&self, size: usize) -> bool {
        self.max_batch_size.map_or(true, |max| size <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits() {
        assert!(BulkRequestConfig::with_max_batch_size(10).allows(10));
        assert!(!BulkRequestConfig::with_max_batch_size(10).allows(11));
        assert!(BulkRequestConfig::unlimited().allows(usize::MAX));
    }
}
