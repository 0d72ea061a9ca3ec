//! OpenSearch provider implementation.
//!
//! This module provides the concrete implementation of `SearchIndexProvider`
//! using the OpenSearch Rust crate.

use async_trait::async_trait;
use opensearch::{
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    http::response::Response,
    indices::{
        IndicesCreateParts, IndicesDeleteParts, IndicesGetAliasParts, IndicesGetParts,
        IndicesPutSettingsParts, IndicesRefreshParts,
    },
    snapshot::SnapshotCreateParts,
    BulkParts, CountParts, OpenSearch,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};
use url::Url;

use crate::config::BulkRequestConfig;
use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::types::{AliasAction, BulkItemResult, BulkSummary};

/// OpenSearch provider implementation.
///
/// Manages whole index generations: creation with explicit settings and
/// mappings, bulk loading, atomic alias moves and deletion.
///
/// # Example
///
/// ```ignore
/// let provider = OpenSearchProvider::new("http://localhost:9200", BulkRequestConfig::default())?;
/// provider.create_index("transactions_v3", &template.index_body()).await?;
/// let summary = provider.bulk_index("transactions_v3", &documents).await?;
/// ```
pub struct OpenSearchProvider {
    client: OpenSearch,
    config: BulkRequestConfig,
}

impl OpenSearchProvider {
    /// Create a new OpenSearch provider connected to the specified URL.
    ///
    /// # Arguments
    ///
    /// * `url` - The OpenSearch server URL (e.g., "http://localhost:9200")
    /// * `config` - Bulk request limits and the request timeout
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchProvider)` - A new provider instance
    /// * `Err(SearchIndexError)` - If connection setup fails
    pub fn new(url: &str, config: BulkRequestConfig) -> Result<Self, SearchIndexError> {
        let parsed_url =
            Url::parse(url).map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let client = OpenSearch::new(transport);

        info!(
            url = %url,
            max_batch_size = ?config.max_batch_size,
            "Created OpenSearch provider"
        );

        Ok(Self { client, config })
    }

    /// Check that the cluster answers.
    pub async fn ping(&self) -> Result<(), SearchIndexError> {
        let response = self.client.ping().send().await?;
        let status = response.status_code();
        if !status.is_success() {
            return Err(SearchIndexError::connection(format!(
                "Ping failed with status {}",
                status
            )));
        }
        Ok(())
    }

    fn check_batch_size(&self, size: usize) -> Result<(), SearchIndexError> {
        match self.config.max_batch_size {
            Some(max) if size > max => Err(SearchIndexError::batch_size_exceeded(size, max)),
            _ => Ok(()),
        }
    }

    /// Turn a non-success response into an error built by `otherwise`.
    async fn ensure_success(
        response: Response,
        operation: &str,
        otherwise: fn(String) -> SearchIndexError,
    ) -> Result<Response, SearchIndexError> {
        let status = response.status_code();
        if status.is_success() {
            return Ok(response);
        }
        let error_body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %error_body, operation, "Request failed");
        Err(SearchIndexError::from_status(
            status.as_u16(),
            format!("{} failed: {}", operation, error_body),
            otherwise,
        ))
    }

    async fn send_bulk(
        &self,
        index: &str,
        body: Vec<JsonBody<Value>>,
        action: &str,
    ) -> Result<BulkSummary, SearchIndexError> {
        let response = self
            .client
            .bulk(BulkParts::Index(index))
            .body(body)
            .send()
            .await?;
        let response =
            Self::ensure_success(response, "bulk", SearchIndexError::BulkIndexError).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;
        let results = parse_bulk_items(&body, action)?;
        Ok(BulkSummary::from_results(results))
    }
}

/// Read per-item outcomes from a bulk response.
///
/// A `delete` of a missing document (404) counts as a success.
fn parse_bulk_items(body: &Value, action: &str) -> Result<Vec<BulkItemResult>, SearchIndexError> {
    let items = body["items"]
        .as_array()
        .ok_or_else(|| SearchIndexError::parse("Bulk response has no items"))?;

    items
        .iter()
        .map(|item| {
            let outcome = &item[action];
            let id = outcome["_id"]
                .as_str()
                .ok_or_else(|| SearchIndexError::parse("Bulk item has no _id"))?
                .to_string();
            let status = outcome["status"].as_u64().unwrap_or(0) as u16;
            let not_found_delete = action == "delete" && status == 404;
            let success = (200..300).contains(&status) || not_found_delete;
            let error = if success {
                None
            } else {
                Some(match &outcome["error"] {
                    Value::Object(err) => format!(
                        "{}: {}",
                        err.get("type").and_then(Value::as_str).unwrap_or("error"),
                        err.get("reason").and_then(Value::as_str).unwrap_or("")
                    ),
                    Value::Null => format!("status {}", status),
                    other => other.to_string(),
                })
            };
            Ok(BulkItemResult {
                id,
                success,
                status,
                error,
            })
        })
        .collect()
}

#[async_trait]
impl SearchIndexProvider for OpenSearchProvider {
    async fn create_index(&self, index: &str, body: &Value) -> Result<(), SearchIndexError> {
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(body.clone())
            .send()
            .await?;
        Self::ensure_success(response, "create index", SearchIndexError::IndexCreationError)
            .await?;

        info!(index = %index, "Index created");
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), SearchIndexError> {
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[index]))
            .send()
            .await?;

        // 404 is acceptable - the generation may already be gone
        if response.status_code().as_u16() == 404 {
            debug!(index = %index, "Index already absent");
            return Ok(());
        }
        Self::ensure_success(response, "delete index", SearchIndexError::IndexDeletionError)
            .await?;

        info!(index = %index, "Index deleted");
        Ok(())
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: &[(String, Map<String, Value>)],
    ) -> Result<BulkSummary, SearchIndexError> {
        if documents.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.check_batch_size(documents.len())?;

        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(documents.len() * 2);
        for (id, source) in documents {
            body.push(json!({ "index": { "_id": id } }).into());
            body.push(Value::Object(source.clone()).into());
        }

        let summary = self.send_bulk(index, body, "index").await?;
        debug!(
            index = %index,
            total = summary.total,
            failed = summary.failed,
            "Bulk index completed"
        );
        Ok(summary)
    }

    async fn bulk_delete(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<BulkSummary, SearchIndexError> {
        if ids.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.check_batch_size(ids.len())?;

        let body: Vec<JsonBody<Value>> = ids
            .iter()
            .map(|id| json!({ "delete": { "_id": id } }).into())
            .collect();

        let summary = self.send_bulk(index, body, "delete").await?;
        debug!(index = %index, total = summary.total, failed = summary.failed, "Bulk delete completed");
        Ok(summary)
    }

    async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), SearchIndexError> {
        let response = self
            .client
            .indices()
            .put_settings(IndicesPutSettingsParts::Index(&[index]))
            .body(settings.clone())
            .send()
            .await?;
        Self::ensure_success(response, "put settings", SearchIndexError::SettingsError).await?;
        Ok(())
    }

    async fn refresh_index(&self, index: &str) -> Result<(), SearchIndexError> {
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[index]))
            .send()
            .await?;
        Self::ensure_success(response, "refresh", SearchIndexError::SettingsError).await?;
        Ok(())
    }

    async fn count_documents(&self, index: &str) -> Result<u64, SearchIndexError> {
        let response = self
            .client
            .count(CountParts::Index(&[index]))
            .send()
            .await?;
        let response = Self::ensure_success(response, "count", SearchIndexError::Unknown).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;
        body["count"]
            .as_u64()
            .ok_or_else(|| SearchIndexError::parse("Count response has no count"))
    }

    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, SearchIndexError> {
        let response = self
            .client
            .indices()
            .get(IndicesGetParts::Index(&[pattern]))
            .allow_no_indices(true)
            .send()
            .await?;
        if response.status_code().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let response = Self::ensure_success(response, "list indices", SearchIndexError::Unknown).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;

        let mut names: Vec<String> = body
            .as_object()
            .map(|indices| indices.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn get_alias_targets(&self, alias: &str) -> Result<Vec<String>, SearchIndexError> {
        let response = self
            .client
            .indices()
            .get_alias(IndicesGetAliasParts::Name(&[alias]))
            .send()
            .await?;

        // 404 means the alias does not exist yet
        if response.status_code().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let response = Self::ensure_success(response, "get alias", SearchIndexError::AliasError).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;

        let mut targets: Vec<String> = body
            .as_object()
            .map(|indices| indices.keys().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), SearchIndexError> {
        if actions.is_empty() {
            return Ok(());
        }
        let actions = actions
            .iter()
            .map(AliasAction::to_json)
            .collect::<Result<Vec<_>, _>>()?;

        let response = self
            .client
            .indices()
            .update_aliases()
            .body(json!({ "actions": actions }))
            .send()
            .await?;
        Self::ensure_success(response, "update aliases", SearchIndexError::AliasError).await?;

        info!(actions = actions.len(), "Aliases updated");
        Ok(())
    }

    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        indices: &[String],
    ) -> Result<(), SearchIndexError> {
        if repository.is_empty() || snapshot.is_empty() {
            return Err(SearchIndexError::validation(
                "snapshot repository and name cannot be empty",
            ));
        }
        let response = self
            .client
            .snapshot()
            .create(SnapshotCreateParts::RepositorySnapshot(repository, snapshot))
            .wait_for_completion(false)
            .body(snapshot_body(indices))
            .send()
            .await?;
        Self::ensure_success(response, "create snapshot", SearchIndexError::SnapshotError).await?;

        info!(repository, snapshot, "Snapshot started");
        Ok(())
    }
}

/// Request body for a snapshot limited to the given indices.
fn snapshot_body(indices: &[String]) -> Value {
    json!({
        "indices": indices.join(","),
        "include_global_state": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bulk_items_partial_failure() {
        let body = json!({
            "took": 3,
            "errors": true,
            "items": [
                { "index": { "_id": "1", "status": 201 } },
                { "index": { "_id": "2", "status": 400, "error": {
                    "type": "mapper_parsing_exception",
                    "reason": "failed to parse field [action_date]"
                } } },
                { "index": { "_id": "3", "status": 429, "error": {
                    "type": "es_rejected_execution_exception",
                    "reason": "queue full"
                } } }
            ]
        });

        let items = parse_bulk_items(&body, "index").unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[0].success);
        assert!(!items[1].success);
        assert!(!items[1].is_retryable());
        assert_eq!(
            items[1].error.as_deref(),
            Some("mapper_parsing_exception: failed to parse field [action_date]")
        );
        assert!(items[2].is_retryable());
    }

    #[test]
    fn test_snapshot_body_lists_indices() {
        let body = snapshot_body(&["transactions_v3".to_string(), "awards_v7".to_string()]);
        assert_eq!(body["indices"], "transactions_v3,awards_v7");
        assert_eq!(body["include_global_state"], false);
    }

    #[test]
    fn test_parse_bulk_items_delete_of_missing_document_succeeds() {
        let body = json!({
            "errors": false,
            "items": [
                { "delete": { "_id": "9", "status": 404, "result": "not_found" } }
            ]
        });
        let items = parse_bulk_items(&body, "delete").unwrap();
        assert!(items[0].success);
    }

    #[test]
    fn test_parse_bulk_items_rejects_malformed_response() {
        assert!(matches!(
            parse_bulk_items(&json!({ "errors": false }), "index"),
            Err(SearchIndexError::ParseError(_))
        ));
    }

    #[test]
    fn test_batch_size_limit() {
        let provider =
            OpenSearchProvider::new("http://localhost:9200", BulkRequestConfig::with_max_batch_size(2))
                .unwrap();
        assert!(provider.check_batch_size(2).is_ok());
        assert!(matches!(
            provider.check_batch_size(3),
            Err(SearchIndexError::BatchSizeExceeded { provided: 3, max: 2 })
        ));
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            OpenSearchProvider::new("not a url", BulkRequestConfig::default()),
            Err(SearchIndexError::ConnectionError(_))
        ));
    }
}
