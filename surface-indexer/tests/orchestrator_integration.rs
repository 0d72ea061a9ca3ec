//! End-to-end runs of the orchestrator over in-memory stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use surface_indexer::errors::RebuildError;
use surface_indexer::loader::{LoaderConfig, SearchLoader};
use surface_indexer::orchestrator::{IndexRebuild, Orchestrator};
use surface_indexer::pipeline::{IndexBuildPipeline, PipelineConfig};
use surface_indexer::processor::DocumentMapper;
use surface_indexer::publisher::{AliasSwapCoordinator, PublisherConfig};
use surface_indexer::spec_loader::{parse_document_template, parse_view_spec};
use surface_indexer::views::{ViewAction, ViewSwapCoordinator};
use surface_indexer_repository::opensearch::IndexConfig;
use surface_indexer_repository::{
    AliasAction, BulkItemResult, BulkSummary, RowCursor, SearchIndexError, SearchIndexProvider,
    SourceError, SourceQuery, SourceReader, ViewStore, ViewStoreError, WatermarkRepository,
    WatermarkRepositoryError,
};
use surface_indexer_shared::{
    DdlStatement, Marker, RebuildMode, RowCountGuard, SourceRow, ViewSpec,
};

const AWARDS_VIEW: &str = r#"{
    "final_name": "summary_award_view",
    "refresh": true,
    "matview_sql": ["SELECT awarding_agency_id, type, SUM(total_obligation) AS obligation FROM awards"],
    "group_by": ["awarding_agency_id", "type"],
    "identity_source": "awards.id",
    "indexes": [
        {"name": "summary_award_view_agency_idx", "columns": [{"name": "awarding_agency_id"}]}
    ]
}"#;

const TEMPLATE: &str = r#"{
    "index_patterns": ["transactions_v*"],
    "settings": {"refresh_interval": "1s", "shards": 1, "replicas": 0},
    "mappings": {
        "transaction_id": {"type": "long"},
        "recipient_name": {"type": "text"},
        "award_amount": {"type": "scaled_float", "scaling_factor": 100}
    },
    "id_field": "transaction_id",
    "marker_field": "update_id"
}"#;

/// View store keeping only row counts per relation.
#[derive(Default)]
struct MemoryViewStore {
    rows: Mutex<HashMap<String, u64>>,
    executed: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
}

#[async_trait]
impl ViewStore for MemoryViewStore {
    async fn execute(&self, statement: &DdlStatement) -> Result<(), ViewStoreError> {
        self.executed.lock().unwrap().push(statement.sql.clone());
        Ok(())
    }

    async fn execute_atomic(
        &self,
        view: &str,
        statements: &[DdlStatement],
    ) -> Result<(), ViewStoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(previous) = rows.remove(view) {
            rows.insert(format!("{}_old", view), previous);
        }
        if let Some(staged) = rows.remove(&format!("{}_temp", view)) {
            rows.insert(view.to_string(), staged);
        }
        let mut executed = self.executed.lock().unwrap();
        executed.extend(statements.iter().map(|s| s.sql.clone()));
        Ok(())
    }

    async fn execute_guarded(
        &self,
        view: &str,
        statement: &DdlStatement,
        guard: &RowCountGuard,
    ) -> Result<(u64, u64), ViewStoreError> {
        let rows = self.rows.lock().unwrap().get(view).copied().unwrap_or(0);
        guard
            .check(rows, Some(rows))
            .map_err(|reason| ViewStoreError::Rejected {
                view: view.to_string(),
                reason,
            })?;
        self.executed.lock().unwrap().push(statement.sql.clone());
        Ok((rows, rows))
    }

    async fn relation_exists(&self, name: &str) -> Result<bool, ViewStoreError> {
        Ok(self.rows.lock().unwrap().contains_key(name))
    }

    async fn count_rows(&self, name: &str) -> Result<Option<u64>, ViewStoreError> {
        Ok(self.rows.lock().unwrap().get(name).copied())
    }

    async fn index_names(&self, relation: &str) -> Result<Vec<String>, ViewStoreError> {
        Ok(vec![
            format!("{}_duh_idx", relation),
            format!("{}_agency_idx", relation),
        ])
    }

    async fn drop_view(&self, name: &str) -> Result<(), ViewStoreError> {
        self.rows.lock().unwrap().remove(name);
        self.dropped.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Search cluster with real alias resolution.
#[derive(Default)]
struct MemoryCluster {
    indices: Mutex<HashMap<String, HashMap<String, Map<String, Value>>>>,
    aliases: Mutex<HashMap<String, Vec<String>>>,
    reject: Vec<String>,
}

impl MemoryCluster {
    fn with_generation(self, index: &str, aliased: bool) -> Self {
        self.indices
            .lock()
            .unwrap()
            .insert(index.to_string(), HashMap::new());
        if aliased {
            self.aliases
                .lock()
                .unwrap()
                .insert("transactions".to_string(), vec![index.to_string()]);
        }
        self
    }

    fn resolve(&self, name: &str) -> String {
        self.aliases
            .lock()
            .unwrap()
            .get(name)
            .and_then(|targets| targets.first().cloned())
            .unwrap_or_else(|| name.to_string())
    }

    fn alias_targets(&self) -> Vec<String> {
        self.aliases
            .lock()
            .unwrap()
            .get("transactions")
            .cloned()
            .unwrap_or_default()
    }

    fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn document(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        let target = self.resolve(index);
        self.indices
            .lock()
            .unwrap()
            .get(&target)
            .and_then(|docs| docs.get(id).cloned())
    }
}

#[async_trait]
impl SearchIndexProvider for MemoryCluster {
    async fn create_index(&self, index: &str, _body: &Value) -> Result<(), SearchIndexError> {
        self.indices
            .lock()
            .unwrap()
            .insert(index.to_string(), HashMap::new());
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), SearchIndexError> {
        self.indices.lock().unwrap().remove(index);
        Ok(())
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: &[(String, Map<String, Value>)],
    ) -> Result<BulkSummary, SearchIndexError> {
        let target = self.resolve(index);
        let mut indices = self.indices.lock().unwrap();
        let docs = indices
            .get_mut(&target)
            .ok_or_else(|| SearchIndexError::bulk_index(format!("no such index {}", target)))?;
        let results = documents
            .iter()
            .map(|(id, source)| {
                let success = !self.reject.contains(id);
                if success {
                    docs.insert(id.clone(), source.clone());
                }
                BulkItemResult {
                    id: id.clone(),
                    success,
                    status: if success { 201 } else { 400 },
                    error: (!success).then(|| "mapper_parsing_exception".to_string()),
                }
            })
            .collect();
        Ok(BulkSummary::from_results(results))
    }

    async fn bulk_delete(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<BulkSummary, SearchIndexError> {
        let target = self.resolve(index);
        let mut indices = self.indices.lock().unwrap();
        if let Some(docs) = indices.get_mut(&target) {
            for id in ids {
                docs.remove(id);
            }
        }
        Ok(BulkSummary::from_results(
            ids.iter()
                .map(|id| BulkItemResult {
                    id: id.clone(),
                    success: true,
                    status: 200,
                    error: None,
                })
                .collect(),
        ))
    }

    async fn put_settings(&self, _index: &str, _settings: &Value) -> Result<(), SearchIndexError> {
        Ok(())
    }

    async fn refresh_index(&self, _index: &str) -> Result<(), SearchIndexError> {
        Ok(())
    }

    async fn count_documents(&self, index: &str) -> Result<u64, SearchIndexError> {
        let target = self.resolve(index);
        Ok(self
            .indices
            .lock()
            .unwrap()
            .get(&target)
            .map_or(0, |docs| docs.len() as u64))
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
        Ok(self
            .aliases
            .lock()
            .unwrap()
            .get(alias)
            .cloned()
            .unwrap_or_default())
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
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _repository: &str,
        _snapshot: &str,
        _indices: &[String],
    ) -> Result<(), SearchIndexError> {
        Ok(())
    }
}

struct VecCursor(Vec<SourceRow>);

#[async_trait]
impl RowCursor for VecCursor {
    async fn next_batch(&mut self, limit: usize) -> Result<Vec<SourceRow>, SourceError> {
        let n = limit.min(self.0.len());
        Ok(self.0.drain(..n).collect())
    }

    async fn close(self: Box<Self>) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Source table filtered by marker like the real cursor query.
struct MemorySource {
    rows: Vec<SourceRow>,
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn open(&self, query: &SourceQuery) -> Result<Box<dyn RowCursor>, SourceError> {
        let rows = self
            .rows
            .iter()
            .filter(|row| match (&query.marker_column, &query.after) {
                (Some(column), Some(after)) => row
                    .get(column)
                    .and_then(Marker::from_value)
                    .map_or(false, |m| m > *after),
                _ => true,
            })
            .cloned()
            .collect();
        Ok(Box::new(VecCursor(rows)))
    }
}

#[derive(Default)]
struct MemoryWatermarks(Mutex<Option<Marker>>);

#[async_trait]
impl WatermarkRepository for MemoryWatermarks {
    async fn get_watermark(&self, _id: &str) -> Result<Option<Marker>, WatermarkRepositoryError> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn save_watermark(
        &self,
        _id: &str,
        watermark: &Marker,
    ) -> Result<(), WatermarkRepositoryError> {
        *self.0.lock().unwrap() = Some(watermark.clone());
        Ok(())
    }
}

fn source_rows() -> Vec<SourceRow> {
    [(1, "Acme Corp", "12.50", 100), (2, "Globex", "7", 101), (3, "Initech", "0.01", 102)]
        .iter()
        .map(|(id, name, amount, update_id)| {
            serde_json::from_value(json!({
                "transaction_id": id,
                "recipient_name": name,
                "award_amount": amount,
                "update_id": update_id
            }))
            .unwrap()
        })
        .collect()
}

struct Harness {
    views: Arc<MemoryViewStore>,
    cluster: Arc<MemoryCluster>,
    watermarks: Arc<MemoryWatermarks>,
}

impl Harness {
    fn new(views: MemoryViewStore, cluster: MemoryCluster, watermarks: MemoryWatermarks) -> Self {
        Self {
            views: Arc::new(views),
            cluster: Arc::new(cluster),
            watermarks: Arc::new(watermarks),
        }
    }

    fn index_rebuild(&self) -> IndexRebuild {
        let template = Arc::new(parse_document_template(TEMPLATE).unwrap());
        let loader = SearchLoader::with_config(
            self.cluster.clone(),
            LoaderConfig {
                backoff_base_ms: 1,
                backoff_max: Duration::from_millis(2),
                document_max_retries: 1,
                ..Default::default()
            },
        );
        let pipeline = IndexBuildPipeline::new(
            Arc::new(MemorySource {
                rows: source_rows(),
            }),
            Arc::new(loader),
            self.watermarks.clone(),
            DocumentMapper::new(template.clone()),
            PipelineConfig {
                batch_size: 2,
                ..Default::default()
            },
            "transactions",
        );
        let publisher = AliasSwapCoordinator::new(
            self.cluster.clone(),
            IndexConfig::new("transactions"),
            template,
            PublisherConfig::default(),
        );
        IndexRebuild {
            pipeline,
            publisher,
            query: "SELECT * FROM transaction_search".to_string(),
        }
    }

    fn orchestrator(&self, mode: RebuildMode) -> Orchestrator {
        let spec: ViewSpec = parse_view_spec(AWARDS_VIEW).unwrap();
        Orchestrator::new(mode)
            .with_views(
                Arc::new(ViewSwapCoordinator::new(self.views.clone())),
                vec![spec],
            )
            .with_index(self.index_rebuild())
    }

    fn index_only(&self, mode: RebuildMode) -> Orchestrator {
        Orchestrator::new(mode).with_index(self.index_rebuild())
    }

    fn published_documents(&self) -> Vec<(String, Map<String, Value>)> {
        let target = self.cluster.resolve("transactions");
        let indices = self.cluster.indices.lock().unwrap();
        let mut docs: Vec<(String, Map<String, Value>)> = indices
            .get(&target)
            .map(|docs| docs.clone().into_iter().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }
}

#[tokio::test]
async fn test_full_rebuild_publishes_views_and_index() {
    let views = MemoryViewStore::default();
    views
        .rows
        .lock()
        .unwrap()
        .extend([
            ("summary_award_view".to_string(), 10),
            ("summary_award_view_temp".to_string(), 12),
        ]);
    let harness = Harness::new(
        views,
        MemoryCluster::default().with_generation("transactions_v1", true),
        MemoryWatermarks::default(),
    );

    let report = harness.orchestrator(RebuildMode::Full).run().await;

    assert!(report.is_success(), "{:?}", report);
    let view = report.views[0].outcome.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(view.action, ViewAction::Rebuilt);
    assert_eq!(view.rows, Some(12));
    assert_eq!(view.previous_rows, Some(10));
    assert_eq!(
        *harness.views.dropped.lock().unwrap(),
        vec!["summary_award_view_old".to_string()]
    );

    let index = report.index.as_ref().unwrap();
    assert_eq!(index.target, "transactions_v2");
    assert_eq!(index.outcome.as_ref().unwrap().indexed, 3);
    assert_eq!(harness.cluster.alias_targets(), vec!["transactions_v2"]);
    assert_eq!(harness.cluster.index_names(), vec!["transactions_v2"]);

    let doc = harness.cluster.document("transactions", "1").unwrap();
    assert_eq!(doc["award_amount"], json!(1250));
    assert_eq!(doc["recipient_name"], json!("Acme Corp"));

    // Full runs leave the watermark alone.
    assert_eq!(*harness.watermarks.0.lock().unwrap(), None);
}

#[tokio::test]
async fn test_incremental_run_refreshes_views_and_advances_watermark() {
    let views = MemoryViewStore::default();
    views
        .rows
        .lock()
        .unwrap()
        .insert("summary_award_view".to_string(), 10);
    let harness = Harness::new(
        views,
        MemoryCluster::default().with_generation("transactions_v4", true),
        MemoryWatermarks(Mutex::new(Some(Marker::Integer(100)))),
    );

    let report = harness.orchestrator(RebuildMode::Incremental).run().await;

    assert!(report.is_success(), "{:?}", report);
    let view = report.views[0].outcome.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(view.action, ViewAction::Refreshed);
    assert!(harness
        .views
        .executed
        .lock()
        .unwrap()
        .iter()
        .any(|sql| sql.contains("REFRESH MATERIALIZED VIEW CONCURRENTLY")));

    // Only rows after the watermark were written, through the alias.
    let stats = report.index.as_ref().unwrap().outcome.as_ref().unwrap();
    assert_eq!(stats.indexed, 2);
    assert!(harness.cluster.document("transactions", "1").is_none());
    assert!(harness.cluster.document("transactions", "3").is_some());
    assert_eq!(harness.cluster.alias_targets(), vec!["transactions_v4"]);
    assert_eq!(
        *harness.watermarks.0.lock().unwrap(),
        Some(Marker::Integer(102))
    );
}

#[tokio::test]
async fn test_rejected_documents_keep_previous_generation_published() {
    let views = MemoryViewStore::default();
    views
        .rows
        .lock()
        .unwrap()
        .insert("summary_award_view_temp".to_string(), 5);
    let harness = Harness::new(
        views,
        MemoryCluster {
            reject: vec!["2".to_string()],
            ..Default::default()
        }
        .with_generation("transactions_v1", true),
        MemoryWatermarks::default(),
    );

    let report = harness.orchestrator(RebuildMode::Full).run().await;

    assert!(!report.is_success());
    // The view is independent of the failed index rebuild.
    assert!(report.views[0].outcome.is_ok());

    let index = report.index.as_ref().unwrap();
    assert!(matches!(index.outcome, Err(RebuildError::IndexBuildAborted(_))));
    assert_eq!(harness.cluster.alias_targets(), vec!["transactions_v1"]);
    assert_eq!(harness.cluster.index_names(), vec!["transactions_v1"]);
}

#[tokio::test]
async fn test_cancelled_run_discards_generation() {
    let views = MemoryViewStore::default();
    views
        .rows
        .lock()
        .unwrap()
        .insert("summary_award_view_temp".to_string(), 5);
    let harness = Harness::new(
        views,
        MemoryCluster::default().with_generation("transactions_v1", true),
        MemoryWatermarks::default(),
    );

    let orchestrator = harness.orchestrator(RebuildMode::Full);
    orchestrator.cancel();
    let report = orchestrator.run().await;

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert!(matches!(
        report.index.as_ref().unwrap().outcome,
        Err(RebuildError::Cancelled)
    ));
    assert_eq!(harness.cluster.alias_targets(), vec!["transactions_v1"]);
    assert_eq!(harness.cluster.index_names(), vec!["transactions_v1"]);
}

#[tokio::test]
async fn test_repeated_full_rebuilds_are_identical() {
    let harness = Harness::new(
        MemoryViewStore::default(),
        MemoryCluster::default(),
        MemoryWatermarks::default(),
    );

    let first = harness.index_only(RebuildMode::Full).run().await;
    assert!(first.is_success(), "{:?}", first);
    let first_docs = harness.published_documents();

    let second = harness.index_only(RebuildMode::Full).run().await;
    assert!(second.is_success(), "{:?}", second);

    assert_eq!(harness.cluster.alias_targets(), vec!["transactions_v2"]);
    assert_eq!(harness.cluster.index_names(), vec!["transactions_v2"]);
    assert_eq!(first_docs.len(), 3);
    assert_eq!(harness.published_documents(), first_docs);
}

#[tokio::test]
async fn test_interrupted_incremental_run_converges_on_restart() {
    // Uninterrupted: one incremental run from the start.
    let reference = Harness::new(
        MemoryViewStore::default(),
        MemoryCluster::default().with_generation("transactions_v1", true),
        MemoryWatermarks::default(),
    );
    assert!(reference.index_only(RebuildMode::Incremental).run().await.is_success());

    // Interrupted: the first batch was committed but the watermark stayed at 100.
    let resumed = Harness::new(
        MemoryViewStore::default(),
        MemoryCluster::default().with_generation("transactions_v1", true),
        MemoryWatermarks(Mutex::new(Some(Marker::Integer(100)))),
    );
    let partial: Vec<(String, Map<String, Value>)> = reference
        .published_documents()
        .into_iter()
        .filter(|(id, _)| id == "1" || id == "2")
        .collect();
    resumed.cluster.bulk_index("transactions", &partial).await.unwrap();

    assert!(resumed.index_only(RebuildMode::Incremental).run().await.is_success());

    assert_eq!(resumed.published_documents(), reference.published_documents());
    assert_eq!(
        *resumed.watermarks.0.lock().unwrap(),
        *reference.watermarks.0.lock().unwrap()
    );
}
