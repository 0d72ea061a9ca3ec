//! Loader module for the surface indexer.
//!
//! Writes mapped documents into an index with bulk requests. Whole requests
//! that fail transiently are retried with exponential backoff; documents the
//! engine rejects individually are retried one by one and then counted as failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use surface_indexer_repository::{BulkSummary, SearchIndexError, SearchIndexProvider};
use surface_indexer_shared::Document;
use tokio::time::{sleep, timeout};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, instrument, warn};

use crate::errors::RebuildError;

/// Configuration for the search loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Attempts per bulk request when it fails transiently.
    pub max_attempts: usize,
    /// Base delay of the exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound of a single backoff delay.
    pub backoff_max: Duration,
    /// Individual retries for a document the engine rejected.
    pub document_max_retries: usize,
    /// Time limit of one bulk call.
    pub bulk_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 10,
            backoff_max: Duration::from_secs(30),
            document_max_retries: 3,
            bulk_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of loading one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Documents the engine accepted.
    pub indexed: u64,
    /// Documents still rejected after their individual retries.
    pub failed: u64,
}

/// Loader that indexes documents into the search engine.
pub struct SearchLoader {
    provider: Arc<dyn SearchIndexProvider>,
    config: LoaderConfig,
}

impl SearchLoader {
    /// Create a new search loader with the given provider.
    pub fn new(provider: Arc<dyn SearchIndexProvider>) -> Self {
        Self::with_config(provider, LoaderConfig::default())
    }

    /// Create a new search loader with custom configuration.
    pub fn with_config(provider: Arc<dyn SearchIndexProvider>, config: LoaderConfig) -> Self {
        Self { provider, config }
    }

    /// Index a batch of documents into `index`.
    ///
    /// # Returns
    ///
    /// * `Ok(BatchOutcome)` - Counts of accepted and permanently rejected documents
    /// * `Err(RebuildError::IndexBuildAborted)` - If the batch could not be written
    ///   at all, after retries for transient failures
    #[instrument(skip(self, documents), fields(index = %index, document_count = documents.len()))]
    pub async fn load(
        &self,
        index: &str,
        documents: Vec<Document>,
    ) -> Result<BatchOutcome, RebuildError> {
        if documents.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let count = documents.len();
        let payload: Vec<(String, Map<String, Value>)> =
            documents.into_iter().map(|d| (d.id, d.source)).collect();

        let summary = self
            .submit(index, &payload, |docs| self.provider.bulk_index(index, docs))
            .await
            .map_err(|e| {
                RebuildError::aborted(format!(
                    "batch of {} documents was not written to '{}': {}",
                    count, index, e
                ))
            })?;

        let mut outcome = BatchOutcome {
            indexed: summary.succeeded as u64,
            failed: 0,
        };
        if summary.failed == 0 {
            debug!(count = summary.succeeded, "Indexed all documents");
            return Ok(outcome);
        }

        warn!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Bulk index completed with some failures"
        );

        let positions: HashMap<&str, usize> = payload
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.as_str(), i))
            .collect();
        for item in summary.failures() {
            let accepted = match positions.get(item.id.as_str()) {
                Some(&i) => self.retry_document(index, &payload[i]).await,
                None => false,
            };
            if accepted {
                outcome.indexed += 1;
            } else {
                outcome.failed += 1;
                error!(
                    id = %item.id,
                    status = item.status,
                    error = item.error.as_deref().unwrap_or("unknown"),
                    "Document permanently rejected"
                );
            }
        }
        Ok(outcome)
    }

    /// Delete documents by id, returning how many were removed.
    #[instrument(skip(self, ids), fields(index = %index, id_count = ids.len()))]
    pub async fn delete(&self, index: &str, ids: &[String]) -> Result<u64, RebuildError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let summary = self
            .submit(index, ids, |ids| self.provider.bulk_delete(index, ids))
            .await
            .map_err(|e| {
                RebuildError::aborted(format!(
                    "deletion of {} documents from '{}' failed: {}",
                    ids.len(),
                    index,
                    e
                ))
            })?;

        for item in summary.failures() {
            warn!(
                id = %item.id,
                status = item.status,
                error = item.error.as_deref().unwrap_or("unknown"),
                "Failed to delete document"
            );
        }
        Ok(summary.succeeded as u64)
    }

    /// Retry one rejected document on its own.
    ///
    /// A rejection the engine reports as permanent (a mapping conflict, say)
    /// ends the retries early; throttling and gateway errors use the full budget.
    async fn retry_document(&self, index: &str, document: &(String, Map<String, Value>)) -> bool {
        let single = std::slice::from_ref(document);
        for delay in self.backoff().take(self.config.document_max_retries) {
            sleep(delay).await;
            match self.provider.bulk_index(index, single).await {
                Ok(summary) if summary.failed == 0 => {
                    debug!(id = %document.0, "Rejected document accepted on retry");
                    return true;
                }
                Ok(summary) => {
                    if !summary.failures().any(|item| item.is_retryable()) {
                        debug!(id = %document.0, "Document rejected again, not retryable");
                        return false;
                    }
                }
                Err(e) => debug!(id = %document.0, error = %e, "Document retry failed"),
            }
        }
        false
    }

    /// Send one bulk request under the call timeout, retrying transient failures.
    async fn submit<'a, T, F, Fut>(
        &self,
        index: &str,
        items: &'a [T],
        mut send: F,
    ) -> Result<BulkSummary, RebuildError>
    where
        F: FnMut(&'a [T]) -> Fut,
        Fut: std::future::Future<Output = Result<BulkSummary, SearchIndexError>>,
    {
        let bulk_timeout = self.config.bulk_timeout;
        let strategy = self
            .backoff()
            .take(self.config.max_attempts.saturating_sub(1));

        let result = RetryIf::spawn(
            strategy,
            || {
                let call = send(items);
                async move {
                    match timeout(bulk_timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(SearchIndexError::timeout(format!(
                            "bulk request exceeded {}s",
                            bulk_timeout.as_secs_f64()
                        ))),
                    }
                }
            },
            |e: &SearchIndexError| {
                let transient = e.is_transient();
                if transient {
                    warn!(index = %index, error = %e, "Transient bulk failure, retrying");
                }
                transient
            },
        )
        .await;

        match result {
            Ok(summary) => Ok(summary),
            Err(e) if e.is_transient() => Err(RebuildError::TransientWriteFailure(format!(
                "{} (after {} attempts)",
                e, self.config.max_attempts
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.config.backoff_base_ms)
            .factor(2)
            .max_delay(self.config.backoff_max)
            .map(jitter)
    }
}
