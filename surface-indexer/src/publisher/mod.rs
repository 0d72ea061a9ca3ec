//! Alias swap coordinator.
//!
//! Full rebuilds load a fresh generation `<alias>_v<N>`. Once loaded, the
//! generation gets its final settings, is verified, and the stable alias (with
//! its filtered aliases) is moved onto it in a single `_aliases` request. Old
//! generations are deleted only after that request succeeded. With a snapshot
//! repository configured, the published generation is then snapshotted as
//! `<generation>-<YYYY-MM-DD>`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::json;
use surface_indexer_repository::opensearch::IndexConfig;
use surface_indexer_repository::{AliasAction, SearchIndexProvider};
use surface_indexer_shared::{DocumentTemplate, IndexBuildStats};
use tracing::{error, info, instrument, warn};

use crate::errors::RebuildError;

/// Publication policy.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Permanently rejected documents tolerated in a published generation.
    pub max_failed_documents: u64,
    /// Require the generation's document count to match the indexed count.
    pub verify_document_count: bool,
    /// Snapshot repository that receives each published generation.
    pub snapshot_repository: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_failed_documents: 0,
            verify_document_count: true,
            snapshot_repository: None,
        }
    }
}

/// Name of the snapshot taken of `index` on `date`.
pub fn snapshot_name(index: &str, date: NaiveDate) -> String {
    format!("{}-{}", index, date.format("%Y-%m-%d"))
}

/// A generation allocated for one full rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexGeneration {
    pub name: String,
    pub version: u32,
}

/// Creates, publishes and retires index generations behind one alias.
pub struct AliasSwapCoordinator {
    provider: Arc<dyn SearchIndexProvider>,
    index_config: IndexConfig,
    template: Arc<DocumentTemplate>,
    config: PublisherConfig,
}

impl AliasSwapCoordinator {
    pub fn new(
        provider: Arc<dyn SearchIndexProvider>,
        index_config: IndexConfig,
        template: Arc<DocumentTemplate>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            provider,
            index_config,
            template,
            config,
        }
    }

    pub fn alias(&self) -> &str {
        &self.index_config.alias
    }

    /// Create the next generation with build-time settings.
    #[instrument(skip(self), fields(alias = %self.index_config.alias))]
    pub async fn allocate(&self) -> Result<IndexGeneration, RebuildError> {
        let existing = self
            .provider
            .list_indices(&self.index_config.generation_pattern())
            .await?;
        let version = self.index_config.next_version(&existing);
        let name = self.index_config.generation_name(version);

        self.provider
            .create_index(&name, &self.template.index_body())
            .await?;
        info!(index = %name, version = version, "Allocated index generation");
        Ok(IndexGeneration { name, version })
    }

    /// Publish a loaded generation behind the alias.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The alias points at `generation`; previous generations were
    ///   deleted or left for a later sweep
    /// * `Err(RebuildError::IndexBuildAborted)` - If the generation exceeded the
    ///   failure tolerance or its document count did not match; the alias is unchanged
    #[instrument(skip(self, generation, stats), fields(alias = %self.index_config.alias, index = %generation.name))]
    pub async fn publish(
        &self,
        generation: &IndexGeneration,
        stats: &IndexBuildStats,
    ) -> Result<(), RebuildError> {
        if stats.failed > self.config.max_failed_documents {
            return Err(RebuildError::aborted(format!(
                "{} documents were rejected (tolerance {}); '{}' not published",
                stats.failed, self.config.max_failed_documents, generation.name
            )));
        }

        self.provider
            .put_settings(&generation.name, &self.template.final_settings())
            .await?;
        self.provider.refresh_index(&generation.name).await?;

        if self.config.verify_document_count {
            let count = self.provider.count_documents(&generation.name).await?;
            if count != stats.indexed {
                return Err(RebuildError::aborted(format!(
                    "'{}' holds {} documents but {} were indexed",
                    generation.name, count, stats.indexed
                )));
            }
        }

        let previous = self.alias_targets().await?;
        let actions = self.swap_actions(&generation.name, &previous);
        self.provider.update_aliases(&actions).await?;
        info!(
            previous = ?previous,
            documents = stats.indexed,
            "Alias moved to new generation"
        );

        // The alias already points at the new generation; a failed delete only
        // leaves an orphan for the next sweep.
        for index in previous.iter().filter(|i| **i != generation.name) {
            match self.provider.delete_index(index).await {
                Ok(()) => info!(index = %index, "Deleted previous generation"),
                Err(e) => warn!(index = %index, error = %e, "Failed to delete previous generation"),
            }
        }

        if let Some(repository) = &self.config.snapshot_repository {
            self.snapshot(repository, &generation.name).await;
        }
        Ok(())
    }

    /// Snapshot a published generation. Failures are logged, never returned.
    async fn snapshot(&self, repository: &str, index: &str) {
        let name = snapshot_name(index, Utc::now().date_naive());
        match self
            .provider
            .create_snapshot(repository, &name, &[index.to_string()])
            .await
        {
            Ok(()) => info!(repository, snapshot = %name, "Snapshot requested"),
            Err(e) => warn!(repository, snapshot = %name, error = %e, "Failed to snapshot published generation"),
        }
    }

    /// Delete an unpublished generation after a failed run.
    #[instrument(skip(self, generation), fields(index = %generation.name))]
    pub async fn discard(&self, generation: &IndexGeneration) -> Result<(), RebuildError> {
        self.provider.delete_index(&generation.name).await?;
        info!("Discarded unpublished generation");
        Ok(())
    }

    /// Delete generations of the alias that no alias points at.
    ///
    /// `keep` protects a generation that is still being loaded.
    #[instrument(skip(self), fields(alias = %self.index_config.alias))]
    pub async fn sweep(&self, keep: Option<&str>) -> Result<Vec<String>, RebuildError> {
        let existing = self
            .provider
            .list_indices(&self.index_config.generation_pattern())
            .await?;
        let live = self.alias_targets().await?;

        let mut removed = Vec::new();
        for index in existing {
            if self.index_config.parse_version(&index).is_none()
                || live.contains(&index)
                || keep == Some(index.as_str())
            {
                continue;
            }
            match self.provider.delete_index(&index).await {
                Ok(()) => {
                    info!(index = %index, "Swept orphaned generation");
                    removed.push(index);
                }
                Err(e) => error!(index = %index, error = %e, "Failed to sweep orphaned generation"),
            }
        }
        Ok(removed)
    }

    /// Generations currently behind the alias or any of its filtered aliases.
    async fn alias_targets(&self) -> Result<BTreeSet<String>, RebuildError> {
        let mut targets: BTreeSet<String> = self
            .provider
            .get_alias_targets(&self.index_config.alias)
            .await?
            .into_iter()
            .collect();
        for alias in &self.template.aliases {
            let name = self.index_config.filtered_alias(&alias.suffix);
            targets.extend(self.provider.get_alias_targets(&name).await?);
        }
        Ok(targets)
    }

    fn swap_actions(&self, new_index: &str, previous: &BTreeSet<String>) -> Vec<AliasAction> {
        let filtered: Vec<(String, serde_json::Value)> = self
            .template
            .aliases
            .iter()
            .map(|alias| {
                (
                    self.index_config.filtered_alias(&alias.suffix),
                    json!({ "terms": { alias.field.as_str(): alias.values } }),
                )
            })
            .collect();

        let mut actions = Vec::new();
        for index in previous.iter().filter(|i| i.as_str() != new_index) {
            actions.push(AliasAction::remove(index.as_str(), self.index_config.alias.as_str()));
            for (name, _) in &filtered {
                actions.push(AliasAction::remove(index.as_str(), name.as_str()));
            }
        }
        actions.push(AliasAction::add(new_index, self.index_config.alias.as_str()));
        for (name, filter) in filtered {
            actions.push(AliasAction::add_filtered(new_index, name, filter));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use surface_indexer_repository::{BulkSummary, SearchIndexError};
    use surface_indexer_shared::{FieldMapping, FieldType, FilteredAlias, IndexSettings};

    /// Tracks indices, their document counts and alias bindings.
    #[derive(Default)]
    struct MockCluster {
        indices: Mutex<HashMap<String, u64>>,
        aliases: Mutex<HashMap<String, Vec<String>>>,
        created: Mutex<Vec<(String, Value)>>,
        settings: Mutex<Vec<(String, Value)>>,
        alias_requests: Mutex<Vec<Vec<AliasAction>>>,
        snapshots: Mutex<Vec<(String, String, Vec<String>)>>,
        fail_delete: bool,
        fail_snapshot: bool,
    }

    impl MockCluster {
        fn with_index(self, name: &str, docs: u64) -> Self {
            self.indices.lock().unwrap().insert(name.to_string(), docs);
            self
        }

        fn with_alias(self, alias: &str, index: &str) -> Self {
            self.aliases
                .lock()
                .unwrap()
                .entry(alias.to_string())
                .or_default()
                .push(index.to_string());
            self
        }

        fn set_count(&self, name: &str, docs: u64) {
            self.indices.lock().unwrap().insert(name.to_string(), docs);
        }

        fn targets(&self, alias: &str) -> Vec<String> {
            self.aliases
                .lock()
                .unwrap()
                .get(alias)
                .cloned()
                .unwrap_or_default()
        }

        fn index_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.indices.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl SearchIndexProvider for MockCluster {
        async fn create_index(&self, index: &str, body: &Value) -> Result<(), SearchIndexError> {
            let mut indices = self.indices.lock().unwrap();
            if indices.contains_key(index) {
                return Err(SearchIndexError::index_creation("resource_already_exists_exception"));
            }
            indices.insert(index.to_string(), 0);
            self.created
                .lock()
                .unwrap()
                .push((index.to_string(), body.clone()));
            Ok(())
        }

        async fn delete_index(&self, index: &str) -> Result<(), SearchIndexError> {
            if self.fail_delete {
                return Err(SearchIndexError::index_deletion("cluster_block_exception"));
            }
            self.indices.lock().unwrap().remove(index);
            Ok(())
        }

        async fn bulk_index(
            &self,
            _index: &str,
            _documents: &[(String, Map<String, Value>)],
        ) -> Result<BulkSummary, SearchIndexError> {
            Ok(BulkSummary::from_results(Vec::new()))
        }

        async fn bulk_delete(
            &self,
            _index: &str,
            _ids: &[String],
        ) -> Result<BulkSummary, SearchIndexError> {
            Ok(BulkSummary::from_results(Vec::new()))
        }

        async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), SearchIndexError> {
            self.settings
                .lock()
                .unwrap()
                .push((index.to_string(), settings.clone()));
            Ok(())
        }

        async fn refresh_index(&self, _index: &str) -> Result<(), SearchIndexError> {
            Ok(())
        }

        async fn count_documents(&self, index: &str) -> Result<u64, SearchIndexError> {
            Ok(self.indices.lock().unwrap().get(index).copied().unwrap_or(0))
        }

        async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, SearchIndexError> {
            let prefix = pattern.trim_end_matches('*');
            Ok(self
                .index_names()
                .into_iter()
                .filter(|name| name.starts_with(prefix))
                .collect())
        }

        async fn get_alias_targets(&self, alias: &str) -> Result<Vec<String>, SearchIndexError> {
            Ok(self.targets(alias))
        }

        async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), SearchIndexError> {
            let mut aliases = self.aliases.lock().unwrap();
            for action in actions {
                match action {
                    AliasAction::Add { index, alias, .. } => {
                        aliases.entry(alias.clone()).or_default().push(index.clone())
                    }
                    AliasAction::Remove { index, alias } => {
                        if let Some(targets) = aliases.get_mut(alias) {
                            targets.retain(|t| t != index);
                        }
                    }
                }
            }
            self.alias_requests.lock().unwrap().push(actions.to_vec());
            Ok(())
        }

        async fn create_snapshot(
            &self,
            repository: &str,
            snapshot: &str,
            indices: &[String],
        ) -> Result<(), SearchIndexError> {
            if self.fail_snapshot {
                return Err(SearchIndexError::snapshot("repository_missing_exception"));
            }
            self.snapshots.lock().unwrap().push((
                repository.to_string(),
                snapshot.to_string(),
                indices.to_vec(),
            ));
            Ok(())
        }
    }

    fn template() -> DocumentTemplate {
        DocumentTemplate {
            index_patterns: vec!["transactions_v*".to_string()],
            settings: IndexSettings {
                refresh_interval: "30s".to_string(),
                shards: 3,
                replicas: 1,
                analysis: None,
            },
            sort: None,
            fields: vec![("award_id".to_string(), FieldMapping::of_type(FieldType::Keyword))],
            id_field: "transaction_id".to_string(),
            marker_field: None,
            aliases: vec![FilteredAlias {
                suffix: "contracts".to_string(),
                field: "type".to_string(),
                values: vec!["A".to_string(), "B".to_string()],
            }],
        }
    }

    fn coordinator(cluster: Arc<MockCluster>, config: PublisherConfig) -> AliasSwapCoordinator {
        AliasSwapCoordinator::new(
            cluster,
            IndexConfig::new("transactions"),
            Arc::new(template()),
            config,
        )
    }

    fn stats(indexed: u64, failed: u64) -> IndexBuildStats {
        IndexBuildStats {
            indexed,
            failed,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allocate_uses_next_version_and_build_settings() {
        let cluster = Arc::new(
            MockCluster::default()
                .with_index("transactions_v3", 10)
                .with_index("transactions_v12", 10),
        );
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());

        let generation = publisher.allocate().await.unwrap();

        assert_eq!(generation.name, "transactions_v13");
        assert_eq!(generation.version, 13);
        let created = cluster.created.lock().unwrap();
        assert_eq!(created[0].1["settings"]["index"]["refresh_interval"], "-1");
        assert_eq!(created[0].1["settings"]["index"]["number_of_replicas"], 0);
    }

    #[tokio::test]
    async fn test_publish_swaps_alias_atomically_and_deletes_previous() {
        let cluster = Arc::new(
            MockCluster::default()
                .with_index("transactions_v1", 5)
                .with_alias("transactions", "transactions_v1")
                .with_alias("transactions-contracts", "transactions_v1"),
        );
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());
        let generation = publisher.allocate().await.unwrap();
        cluster.set_count(&generation.name, 8);

        publisher.publish(&generation, &stats(8, 0)).await.unwrap();

        assert_eq!(cluster.targets("transactions"), vec!["transactions_v2"]);
        assert_eq!(cluster.targets("transactions-contracts"), vec!["transactions_v2"]);
        assert_eq!(cluster.index_names(), vec!["transactions_v2"]);

        let requests = cluster.alias_requests.lock().unwrap();
        assert_eq!(requests.len(), 1, "swap must be a single alias request");
        assert!(requests[0].contains(&AliasAction::add_filtered(
            "transactions_v2",
            "transactions-contracts",
            json!({ "terms": { "type": ["A", "B"] } })
        )));

        let settings = cluster.settings.lock().unwrap();
        assert_eq!(settings[0].1["index"]["refresh_interval"], "30s");
        assert_eq!(settings[0].1["index"]["number_of_replicas"], 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_generation_over_tolerance() {
        let cluster = Arc::new(
            MockCluster::default()
                .with_index("transactions_v1", 5)
                .with_alias("transactions", "transactions_v1"),
        );
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());
        let generation = publisher.allocate().await.unwrap();

        let err = publisher.publish(&generation, &stats(8, 1)).await.unwrap_err();

        assert!(matches!(err, RebuildError::IndexBuildAborted(_)));
        assert_eq!(cluster.targets("transactions"), vec!["transactions_v1"]);
        assert!(cluster.alias_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_rejects_count_mismatch() {
        let cluster = Arc::new(MockCluster::default());
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());
        let generation = publisher.allocate().await.unwrap();
        cluster.set_count(&generation.name, 7);

        let err = publisher.publish(&generation, &stats(8, 0)).await.unwrap_err();
        assert!(matches!(err, RebuildError::IndexBuildAborted(_)));
        assert!(cluster.targets("transactions").is_empty());

        // Without verification the same generation is published.
        let publisher = coordinator(
            cluster.clone(),
            PublisherConfig {
                verify_document_count: false,
                ..Default::default()
            },
        );
        publisher.publish(&generation, &stats(8, 0)).await.unwrap();
        assert_eq!(cluster.targets("transactions"), vec!["transactions_v1"]);
    }

    #[tokio::test]
    async fn test_failed_delete_after_swap_is_not_an_error() {
        let cluster = Arc::new(
            MockCluster {
                fail_delete: true,
                ..Default::default()
            }
            .with_index("transactions_v1", 0)
            .with_alias("transactions", "transactions_v1"),
        );
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());
        let generation = publisher.allocate().await.unwrap();

        publisher.publish(&generation, &stats(0, 0)).await.unwrap();

        assert_eq!(cluster.targets("transactions"), vec!["transactions_v2"]);
        assert_eq!(cluster.index_names(), vec!["transactions_v1", "transactions_v2"]);
    }

    #[test]
    fn test_snapshot_name_is_generation_and_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(snapshot_name("transactions_v12", date), "transactions_v12-2024-03-07");
    }

    #[tokio::test]
    async fn test_publish_snapshots_new_generation() {
        let cluster = Arc::new(MockCluster::default());
        let publisher = coordinator(
            cluster.clone(),
            PublisherConfig {
                snapshot_repository: Some("s3-backups".to_string()),
                ..Default::default()
            },
        );
        let generation = publisher.allocate().await.unwrap();

        publisher.publish(&generation, &stats(0, 0)).await.unwrap();

        let snapshots = cluster.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        let (repository, name, indices) = &snapshots[0];
        assert_eq!(repository, "s3-backups");
        assert!(name.starts_with("transactions_v1-"), "{name}");
        assert_eq!(indices, &vec!["transactions_v1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_snapshot_does_not_fail_publish() {
        let cluster = Arc::new(MockCluster {
            fail_snapshot: true,
            ..Default::default()
        });
        let publisher = coordinator(
            cluster.clone(),
            PublisherConfig {
                snapshot_repository: Some("s3-backups".to_string()),
                ..Default::default()
            },
        );
        let generation = publisher.allocate().await.unwrap();

        publisher.publish(&generation, &stats(0, 0)).await.unwrap();

        assert_eq!(cluster.targets("transactions"), vec!["transactions_v1"]);
        assert!(cluster.snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_snapshot_without_repository() {
        let cluster = Arc::new(MockCluster::default());
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());
        let generation = publisher.allocate().await.unwrap();

        publisher.publish(&generation, &stats(0, 0)).await.unwrap();
        assert!(cluster.snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_unaliased_generations() {
        let cluster = Arc::new(
            MockCluster::default()
                .with_index("transactions_v1", 0)
                .with_index("transactions_v2", 0)
                .with_index("transactions_v3", 0)
                .with_index("transactions_v4", 0)
                .with_alias("transactions", "transactions_v3"),
        );
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());

        let removed = publisher.sweep(Some("transactions_v4")).await.unwrap();

        assert_eq!(removed, vec!["transactions_v1", "transactions_v2"]);
        assert_eq!(cluster.index_names(), vec!["transactions_v3", "transactions_v4"]);
    }

    #[tokio::test]
    async fn test_discard_deletes_generation() {
        let cluster = Arc::new(MockCluster::default());
        let publisher = coordinator(cluster.clone(), PublisherConfig::default());
        let generation = publisher.allocate().await.unwrap();

        publisher.discard(&generation).await.unwrap();
        assert!(cluster.index_names().is_empty());
    }
}
