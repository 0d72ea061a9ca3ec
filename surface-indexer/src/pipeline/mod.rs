//! Index build pipeline.
//!
//! Streams rows of the source query in bounded batches, maps them to documents
//! and hands them to the loader. A producer task fetches batches into a bounded
//! channel while up to `max_in_flight` batches are mapped and written
//! concurrently. Incremental runs read rows changed after the persisted
//! watermark and advance it as their very last step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use surface_indexer_repository::{SourceQuery, SourceReader, WatermarkRepository};
use surface_indexer_shared::{IndexBuildStats, Marker, RebuildMode, SourceRow};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::errors::RebuildError;
use crate::loader::SearchLoader;
use crate::processor::DocumentMapper;

/// Id and marker columns the deleted-records query must project.
pub const DELETED_ID_COLUMN: &str = "id";
pub const DELETED_MARKER_COLUMN: &str = "marker";

/// Configuration for the index build pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows fetched per batch.
    pub batch_size: usize,
    /// Batches written concurrently.
    pub max_in_flight: usize,
    /// Rejected documents an incremental run tolerates before refusing to
    /// advance the watermark.
    pub max_failed_documents: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            max_in_flight: 2,
            max_failed_documents: 0,
        }
    }
}

/// Live counters of the running pipeline.
#[derive(Debug, Default)]
pub struct PipelineProgress {
    pub rows_read: AtomicU64,
    pub indexed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

impl PipelineProgress {
    fn record(&self, rows: u64, stats: &IndexBuildStats) {
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
        self.indexed.fetch_add(stats.indexed, Ordering::Relaxed);
        self.failed.fetch_add(stats.failed, Ordering::Relaxed);
        self.skipped.fetch_add(stats.skipped, Ordering::Relaxed);
    }
}

/// Pipeline from the source query to one index or alias.
pub struct IndexBuildPipeline {
    reader: Arc<dyn SourceReader>,
    loader: Arc<SearchLoader>,
    watermarks: Arc<dyn WatermarkRepository>,
    mapper: DocumentMapper,
    config: PipelineConfig,
    watermark_id: String,
    deleted_query: Option<String>,
    progress: Arc<PipelineProgress>,
}

impl IndexBuildPipeline {
    pub fn new(
        reader: Arc<dyn SourceReader>,
        loader: Arc<SearchLoader>,
        watermarks: Arc<dyn WatermarkRepository>,
        mapper: DocumentMapper,
        config: PipelineConfig,
        watermark_id: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            loader,
            watermarks,
            mapper,
            config,
            watermark_id: watermark_id.into(),
            deleted_query: None,
            progress: Arc::new(PipelineProgress::default()),
        }
    }

    /// Query returning `(id, marker)` of records deleted upstream, applied by
    /// incremental runs.
    pub fn with_deleted_query(mut self, query: impl Into<String>) -> Self {
        self.deleted_query = Some(query.into());
        self
    }

    pub fn progress(&self) -> Arc<PipelineProgress> {
        Arc::clone(&self.progress)
    }

    pub fn mapper(&self) -> &DocumentMapper {
        &self.mapper
    }

    /// Run the pipeline into `index`.
    ///
    /// Cancellation is observed between batches: batches already fetched are
    /// still written, then the run returns [`RebuildError::Cancelled`] without
    /// touching the watermark.
    #[instrument(skip(self, query, cancel), fields(index = %index, mode = %mode))]
    pub async fn run(
        &self,
        query: &str,
        index: &str,
        mode: RebuildMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<IndexBuildStats, RebuildError> {
        let (source_query, watermark) = match mode {
            RebuildMode::Full => (SourceQuery::full(query), None),
            RebuildMode::Incremental => {
                let marker = self.marker_column()?;
                let watermark = self.watermarks.get_watermark(&self.watermark_id).await?;
                info!(watermark = ?watermark.as_ref().map(|w| w.to_string()), "Resuming after watermark");
                (
                    SourceQuery::changed_since(query, marker, watermark.clone()),
                    watermark,
                )
            }
        };

        let mut stats = self.index_rows(&source_query, index, cancel.clone()).await?;

        if mode == RebuildMode::Full {
            info!(
                indexed = stats.indexed,
                failed = stats.failed,
                skipped = stats.skipped,
                batches = stats.batches,
                "Index build completed"
            );
            return Ok(stats);
        }

        if let Some(ref deleted_query) = self.deleted_query {
            stats.deleted = self
                .delete_rows(deleted_query, index, watermark.clone(), &cancel)
                .await?;
        }

        if stats.failed > self.config.max_failed_documents {
            return Err(RebuildError::aborted(format!(
                "{} documents were rejected (tolerance {}); watermark not advanced",
                stats.failed, self.config.max_failed_documents
            )));
        }

        // Advancing the watermark is the last step: a crash before it only
        // causes rows to be indexed again.
        match Marker::max_of(watermark.clone(), stats.max_marker.clone()) {
            Some(next) if Some(&next) != watermark.as_ref() => {
                self.watermarks
                    .save_watermark(&self.watermark_id, &next)
                    .await?;
                info!(watermark = %next, "Watermark advanced");
            }
            _ => debug!("No newer rows, watermark unchanged"),
        }

        info!(
            indexed = stats.indexed,
            failed = stats.failed,
            skipped = stats.skipped,
            deleted = stats.deleted,
            batches = stats.batches,
            "Incremental index run completed"
        );
        Ok(stats)
    }

    fn marker_column(&self) -> Result<String, RebuildError> {
        self.mapper
            .template()
            .marker_field
            .clone()
            .ok_or_else(|| {
                RebuildError::config("incremental runs require a marker_field in the document template")
            })
    }

    async fn index_rows(
        &self,
        source_query: &SourceQuery,
        index: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<IndexBuildStats, RebuildError> {
        let mut cursor = self.reader.open(source_query).await?;
        let (tx, rx) = mpsc::channel::<Vec<SourceRow>>(self.config.max_in_flight.max(1));
        let batch_size = self.config.batch_size.max(1);

        let producer = tokio::spawn(async move {
            let result = loop {
                if *cancel.borrow() {
                    break Ok(true);
                }
                match cursor.next_batch(batch_size).await {
                    Ok(rows) if rows.is_empty() => break Ok(false),
                    Ok(rows) => {
                        // The consumer stopped after a failure.
                        if tx.send(rows).await.is_err() {
                            break Ok(false);
                        }
                    }
                    Err(e) => break Err(e),
                }
            };
            if let Err(e) = cursor.close().await {
                warn!(error = %e, "Failed to close source cursor");
            }
            result
        });

        let mut batches = ReceiverStream::new(rx)
            .map(|rows| self.index_batch(index, rows))
            .buffer_unordered(self.config.max_in_flight.max(1));

        let mut stats = IndexBuildStats::default();
        let mut failure = None;
        while let Some(result) = batches.next().await {
            match result {
                Ok(batch) => stats.absorb(&batch),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(batches);

        let produced = producer
            .await
            .map_err(|e| RebuildError::Source(format!("row producer task failed: {}", e)))?;
        if let Some(e) = failure {
            return Err(e);
        }
        if produced? {
            warn!(
                indexed = stats.indexed,
                batches = stats.batches,
                "Index build cancelled"
            );
            return Err(RebuildError::Cancelled);
        }
        Ok(stats)
    }

    async fn index_batch(
        &self,
        index: &str,
        rows: Vec<SourceRow>,
    ) -> Result<IndexBuildStats, RebuildError> {
        let row_count = rows.len() as u64;
        let mapped = self.mapper.map_batch(rows);
        let outcome = self.loader.load(index, mapped.documents).await?;

        let stats = IndexBuildStats {
            indexed: outcome.indexed,
            failed: outcome.failed,
            skipped: mapped.skipped,
            deleted: 0,
            batches: 1,
            max_marker: mapped.max_marker,
        };
        self.progress.record(row_count, &stats);
        Ok(stats)
    }

    /// Remove documents of records deleted after the watermark.
    async fn delete_rows(
        &self,
        deleted_query: &str,
        index: &str,
        watermark: Option<Marker>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<u64, RebuildError> {
        let query = SourceQuery::changed_since(deleted_query, DELETED_MARKER_COLUMN, watermark);
        let mut cursor = self.reader.open(&query).await?;
        let batch_size = self.config.batch_size.max(1);

        let mut deleted = 0;
        let result = loop {
            if *cancel.borrow() {
                break Err(RebuildError::Cancelled);
            }
            let rows = match cursor.next_batch(batch_size).await {
                Ok(rows) if rows.is_empty() => break Ok(()),
                Ok(rows) => rows,
                Err(e) => break Err(e.into()),
            };
            let ids: Vec<String> = rows
                .iter()
                .filter_map(|row| row.get_non_null(DELETED_ID_COLUMN))
                .map(|id| match id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            match self.loader.delete(index, &ids).await {
                Ok(n) => deleted += n,
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = cursor.close().await {
            warn!(error = %e, "Failed to close deleted-records cursor");
        }
        result?;

        info!(deleted = deleted, "Deleted records removed from index");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use surface_indexer_repository::{
        AliasAction, BulkItemResult, BulkSummary, RowCursor, SearchIndexError,
        SearchIndexProvider, SourceError, WatermarkRepositoryError,
    };
    use surface_indexer_shared::{DocumentTemplate, FieldMapping, FieldType, IndexSettings};

    use crate::loader::LoaderConfig;

    struct MockCursor {
        rows: Vec<SourceRow>,
    }

    #[async_trait]
    impl RowCursor for MockCursor {
        async fn next_batch(&mut self, limit: usize) -> Result<Vec<SourceRow>, SourceError> {
            let n = limit.min(self.rows.len());
            Ok(self.rows.drain(..n).collect())
        }

        async fn close(self: Box<Self>) -> Result<(), SourceError> {
            Ok(())
        }
    }

    /// Serves `rows` for the main query and `deleted` for the deleted-records query.
    #[derive(Default)]
    struct MockReader {
        rows: Vec<SourceRow>,
        deleted: Vec<SourceRow>,
        opened: Mutex<Vec<SourceQuery>>,
    }

    #[async_trait]
    impl SourceReader for MockReader {
        async fn open(&self, query: &SourceQuery) -> Result<Box<dyn RowCursor>, SourceError> {
            self.opened.lock().unwrap().push(query.clone());
            let rows = if query.marker_column.as_deref() == Some(DELETED_MARKER_COLUMN) {
                self.deleted.clone()
            } else {
                self.rows.clone()
            };
            Ok(Box::new(MockCursor { rows }))
        }
    }

    #[derive(Default)]
    struct MockWatermarks {
        value: Mutex<Option<Marker>>,
        fail_save: bool,
    }

    #[async_trait]
    impl WatermarkRepository for MockWatermarks {
        async fn get_watermark(&self, _id: &str) -> Result<Option<Marker>, WatermarkRepositoryError> {
            Ok(self.value.lock().unwrap().clone())
        }

        async fn save_watermark(
            &self,
            _id: &str,
            watermark: &Marker,
        ) -> Result<(), WatermarkRepositoryError> {
            if self.fail_save {
                return Err(WatermarkRepositoryError::Database(sqlx::Error::PoolTimedOut));
            }
            *self.value.lock().unwrap() = Some(watermark.clone());
            Ok(())
        }
    }

    /// In-memory index keyed by index name.
    #[derive(Default)]
    struct MemoryIndex {
        documents: Mutex<HashMap<String, Map<String, Value>>>,
        deleted: Mutex<Vec<String>>,
        reject: Vec<String>,
    }

    #[async_trait]
    impl SearchIndexProvider for MemoryIndex {
        async fn create_index(&self, _index: &str, _body: &Value) -> Result<(), SearchIndexError> {
            Ok(())
        }

        async fn delete_index(&self, _index: &str) -> Result<(), SearchIndexError> {
            Ok(())
        }

        async fn bulk_index(
            &self,
            _index: &str,
            documents: &[(String, Map<String, Value>)],
        ) -> Result<BulkSummary, SearchIndexError> {
            let mut stored = self.documents.lock().unwrap();
            let results = documents
                .iter()
                .map(|(id, source)| {
                    let success = !self.reject.contains(id);
                    if success {
                        stored.insert(id.clone(), source.clone());
                    }
                    BulkItemResult {
                        id: id.clone(),
                        success,
                        status: if success { 201 } else { 400 },
                        error: None,
                    }
                })
                .collect();
            Ok(BulkSummary::from_results(results))
        }

        async fn bulk_delete(
            &self,
            _index: &str,
            ids: &[String],
        ) -> Result<BulkSummary, SearchIndexError> {
            self.deleted.lock().unwrap().extend(ids.iter().cloned());
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

        async fn count_documents(&self, _index: &str) -> Result<u64, SearchIndexError> {
            Ok(self.documents.lock().unwrap().len() as u64)
        }

        async fn list_indices(&self, _pattern: &str) -> Result<Vec<String>, SearchIndexError> {
            Ok(Vec::new())
        }

        async fn get_alias_targets(&self, _alias: &str) -> Result<Vec<String>, SearchIndexError> {
            Ok(Vec::new())
        }

        async fn update_aliases(&self, _actions: &[AliasAction]) -> Result<(), SearchIndexError> {
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

    fn template(marker_field: Option<&str>) -> DocumentTemplate {
        DocumentTemplate {
            index_patterns: vec!["transactions_v*".to_string()],
            settings: IndexSettings {
                refresh_interval: "1s".to_string(),
                shards: 1,
                replicas: 0,
                analysis: None,
            },
            sort: None,
            fields: vec![
                ("transaction_id".to_string(), FieldMapping::of_type(FieldType::Long)),
                ("recipient_name".to_string(), FieldMapping::of_type(FieldType::Text)),
            ],
            id_field: "transaction_id".to_string(),
            marker_field: marker_field.map(str::to_string),
            aliases: Vec::new(),
        }
    }

    fn rows(markers: &[(i64, i64)]) -> Vec<SourceRow> {
        markers
            .iter()
            .map(|(id, marker)| {
                serde_json::from_value(json!({
                    "transaction_id": id,
                    "recipient_name": format!("recipient {}", id),
                    "update_id": marker
                }))
                .unwrap()
            })
            .collect()
    }

    struct Fixture {
        index: Arc<MemoryIndex>,
        reader: Arc<MockReader>,
        watermarks: Arc<MockWatermarks>,
        pipeline: IndexBuildPipeline,
    }

    fn fixture(reader: MockReader, index: MemoryIndex, watermarks: MockWatermarks) -> Fixture {
        let index = Arc::new(index);
        let reader = Arc::new(reader);
        let watermarks = Arc::new(watermarks);
        let loader = SearchLoader::with_config(
            index.clone(),
            LoaderConfig {
                backoff_base_ms: 1,
                backoff_max: Duration::from_millis(2),
                document_max_retries: 1,
                ..Default::default()
            },
        );
        let pipeline = IndexBuildPipeline::new(
            reader.clone(),
            Arc::new(loader),
            watermarks.clone(),
            DocumentMapper::new(Arc::new(template(Some("update_id")))),
            PipelineConfig {
                batch_size: 2,
                max_in_flight: 2,
                max_failed_documents: 0,
            },
            "transactions",
        );
        Fixture {
            index,
            reader,
            watermarks,
            pipeline,
        }
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the flag readable after the sender is gone.
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn test_full_run_indexes_every_row() {
        let mut source = rows(&[(1, 10), (2, 11), (3, 12), (4, 13)]);
        source.push(serde_json::from_value(json!({"recipient_name": "no id"})).unwrap());
        let f = fixture(
            MockReader {
                rows: source,
                ..Default::default()
            },
            MemoryIndex::default(),
            MockWatermarks::default(),
        );

        let stats = f
            .pipeline
            .run("SELECT * FROM tx", "transactions_v1", RebuildMode::Full, not_cancelled())
            .await
            .unwrap();

        assert_eq!(stats.indexed, 4);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.batches, 3);
        assert_eq!(f.index.documents.lock().unwrap().len(), 4);
        assert_eq!(f.watermarks.value.lock().unwrap().clone(), None);
        assert_eq!(f.pipeline.progress().rows_read.load(Ordering::Relaxed), 5);
        assert_eq!(f.reader.opened.lock().unwrap()[0].after, None);
    }

    #[tokio::test]
    async fn test_incremental_run_advances_watermark_to_maximum() {
        // Batches finish out of order; the highest marker wins, not the last.
        let f = fixture(
            MockReader {
                rows: rows(&[(1, 40), (2, 90), (3, 41), (4, 42), (5, 43)]),
                ..Default::default()
            },
            MemoryIndex::default(),
            MockWatermarks {
                value: Mutex::new(Some(Marker::Integer(30))),
                ..Default::default()
            },
        );

        let stats = f
            .pipeline
            .run("SELECT * FROM tx", "transactions", RebuildMode::Incremental, not_cancelled())
            .await
            .unwrap();

        assert_eq!(stats.indexed, 5);
        assert_eq!(stats.max_marker, Some(Marker::Integer(90)));
        assert_eq!(
            f.watermarks.value.lock().unwrap().clone(),
            Some(Marker::Integer(90))
        );
        let opened = f.reader.opened.lock().unwrap();
        assert_eq!(opened[0].after, Some(Marker::Integer(30)));
        assert_eq!(opened[0].marker_column.as_deref(), Some("update_id"));
    }

    #[tokio::test]
    async fn test_incremental_run_with_no_new_rows_keeps_watermark() {
        let f = fixture(
            MockReader::default(),
            MemoryIndex::default(),
            MockWatermarks {
                value: Mutex::new(Some(Marker::Integer(30))),
                ..Default::default()
            },
        );

        let stats = f
            .pipeline
            .run("SELECT * FROM tx", "transactions", RebuildMode::Incremental, not_cancelled())
            .await
            .unwrap();

        assert_eq!(stats.processed(), 0);
        assert_eq!(
            f.watermarks.value.lock().unwrap().clone(),
            Some(Marker::Integer(30))
        );
    }

    #[tokio::test]
    async fn test_rejected_documents_block_watermark() {
        let f = fixture(
            MockReader {
                rows: rows(&[(1, 40), (2, 41)]),
                ..Default::default()
            },
            MemoryIndex {
                reject: vec!["2".to_string()],
                ..Default::default()
            },
            MockWatermarks::default(),
        );

        let err = f
            .pipeline
            .run("SELECT * FROM tx", "transactions", RebuildMode::Incremental, not_cancelled())
            .await
            .unwrap_err();

        assert!(matches!(err, RebuildError::IndexBuildAborted(_)), "{err}");
        assert_eq!(f.watermarks.value.lock().unwrap().clone(), None);
    }

    #[tokio::test]
    async fn test_watermark_save_failure_is_fatal() {
        let f = fixture(
            MockReader {
                rows: rows(&[(1, 40)]),
                ..Default::default()
            },
            MemoryIndex::default(),
            MockWatermarks {
                fail_save: true,
                ..Default::default()
            },
        );

        let err = f
            .pipeline
            .run("SELECT * FROM tx", "transactions", RebuildMode::Incremental, not_cancelled())
            .await
            .unwrap_err();

        assert!(matches!(err, RebuildError::WatermarkPersistence(_)), "{err}");
    }

    #[tokio::test]
    async fn test_cancelled_run_does_not_advance_watermark() {
        let f = fixture(
            MockReader {
                rows: rows(&[(1, 40), (2, 41)]),
                ..Default::default()
            },
            MemoryIndex::default(),
            MockWatermarks::default(),
        );
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = f
            .pipeline
            .run("SELECT * FROM tx", "transactions", RebuildMode::Incremental, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, RebuildError::Cancelled));
        assert!(f.index.documents.lock().unwrap().is_empty());
        assert_eq!(f.watermarks.value.lock().unwrap().clone(), None);
    }

    #[tokio::test]
    async fn test_deleted_records_are_removed() {
        let deleted = vec![
            serde_json::from_value(json!({"id": 7, "marker": 44})).unwrap(),
            serde_json::from_value(json!({"id": "8", "marker": 45})).unwrap(),
        ];
        let mut f = fixture(
            MockReader {
                rows: rows(&[(1, 40)]),
                deleted,
                ..Default::default()
            },
            MemoryIndex::default(),
            MockWatermarks {
                value: Mutex::new(Some(Marker::Integer(30))),
                ..Default::default()
            },
        );
        f.pipeline = f.pipeline.with_deleted_query("SELECT id, marker FROM deleted_tx");

        let stats = f
            .pipeline
            .run("SELECT * FROM tx", "transactions", RebuildMode::Incremental, not_cancelled())
            .await
            .unwrap();

        assert_eq!(stats.deleted, 2);
        assert_eq!(*f.index.deleted.lock().unwrap(), vec!["7".to_string(), "8".to_string()]);
        // Deletion markers do not move the watermark.
        assert_eq!(
            f.watermarks.value.lock().unwrap().clone(),
            Some(Marker::Integer(40))
        );
        let opened = f.reader.opened.lock().unwrap();
        assert_eq!(opened[1].after, Some(Marker::Integer(30)));
    }

    #[tokio::test]
    async fn test_incremental_requires_marker_field() {
        let index = Arc::new(MemoryIndex::default());
        let pipeline = IndexBuildPipeline::new(
            Arc::new(MockReader::default()),
            Arc::new(SearchLoader::new(index)),
            Arc::new(MockWatermarks::default()),
            DocumentMapper::new(Arc::new(template(None))),
            PipelineConfig::default(),
            "transactions",
        );

        let err = pipeline
            .run("SELECT 1", "transactions", RebuildMode::Incremental, not_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, RebuildError::Configuration(_)));
    }
}
