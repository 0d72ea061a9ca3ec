//! Search index provider trait definition.
//!
//! This module defines the abstract interface for search index operations,
//! allowing for different backend implementations (OpenSearch, Elasticsearch, etc.).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::SearchIndexError;
use crate::types::{AliasAction, BulkSummary};

/// Abstracts the underlying search index implementation (OpenSearch, Elasticsearch, etc.).
///
/// The rebuild pipeline only needs index-level operations: create and drop whole
/// generations, bulk-load documents into one, and move aliases between
/// generations atomically. Implementations are injected as
/// `Arc<dyn SearchIndexProvider>` so tests can substitute an in-memory double.
///
/// All methods return `Result<T, SearchIndexError>`; callers decide what to retry
/// with [`SearchIndexError::is_transient`].
#[async_trait]
pub trait SearchIndexProvider: Send + Sync {
    /// Create an index with the given settings and mappings body.
    ///
    /// Fails if the index already exists.
    async fn create_index(&self, index: &str, body: &Value) -> Result<(), SearchIndexError>;

    /// Delete an index. Deleting a missing index is not an error.
    async fn delete_index(&self, index: &str) -> Result<(), SearchIndexError>;

    /// Index documents (id, source) into `index`, replacing existing ones.
    ///
    /// # Returns
    ///
    /// * `Ok(BulkSummary)` - Per-document outcome; rejected documents are
    ///   reported in the summary rather than as an error
    /// * `Err(SearchIndexError)` - If the request as a whole failed
    async fn bulk_index(
        &self,
        index: &str,
        documents: &[(String, Map<String, Value>)],
    ) -> Result<BulkSummary, SearchIndexError>;

    /// Delete documents by id. Missing documents count as deleted.
    async fn bulk_delete(&self, index: &str, ids: &[String])
        -> Result<BulkSummary, SearchIndexError>;

    /// Apply dynamic settings (replicas, refresh interval, ...).
    async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), SearchIndexError>;

    /// Make all indexed documents visible to search.
    async fn refresh_index(&self, index: &str) -> Result<(), SearchIndexError>;

    /// Number of searchable documents in `index`.
    async fn count_documents(&self, index: &str) -> Result<u64, SearchIndexError>;

    /// Names of existing indices matching a wildcard pattern.
    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, SearchIndexError>;

    /// Indices an alias currently points to (empty when the alias does not exist).
    async fn get_alias_targets(&self, alias: &str) -> Result<Vec<String>, SearchIndexError>;

    /// Apply all alias actions in one atomic request.
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), SearchIndexError>;

    /// Start a snapshot of `indices` into a registered snapshot repository.
    ///
    /// Returns once the engine has accepted the request, not when the
    /// snapshot completes.
    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        indices: &[String],
    ) -> Result<(), SearchIndexError>;
}
