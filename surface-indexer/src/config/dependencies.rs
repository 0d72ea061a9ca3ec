//! Dependency initialization and wiring for the surface indexer.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use surface_indexer_repository::opensearch::IndexConfig;
use surface_indexer_repository::postgres;
use surface_indexer_repository::{
    BulkRequestConfig, OpenSearchProvider, PostgresSourceReader, PostgresViewStore,
    PostgresWatermarkRepository,
};
use tokio::time::sleep;
use tracing::{info, warn};

use super::Settings;
use crate::loader::SearchLoader;
use crate::orchestrator::{IndexRebuild, Orchestrator};
use crate::pipeline::IndexBuildPipeline;
use crate::processor::DocumentMapper;
use crate::publisher::AliasSwapCoordinator;
use crate::spec_loader;
use crate::views::ViewSwapCoordinator;
use crate::IndexingError;

/// Connections held open for the source and view work of one invocation.
const DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Connection mode for OpenSearch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Fail immediately if connection fails.
    FailFast,
    /// Retry connection every retry interval until successful.
    Retry,
}

impl ConnectionMode {
    /// Parse a connection mode.
    ///
    /// Valid values: "fail-fast" or "retry" (case-insensitive)
    /// Defaults to "retry" if not set or invalid.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("retry").to_lowercase().as_str() {
            "fail-fast" | "failfast" | "fail_fast" => Self::FailFast,
            "retry" => Self::Retry,
            _ => {
                warn!("Invalid OPENSEARCH_CONNECTION_MODE, defaulting to 'retry'");
                Self::Retry
            }
        }
    }
}

/// Container for all initialized dependencies.
pub struct Dependencies {
    /// The configured orchestrator ready to run.
    pub orchestrator: Orchestrator,
}

impl Dependencies {
    /// Initialize all dependencies from environment variables.
    ///
    /// Specs and query files are loaded and validated before any connection is
    /// opened, so a broken spec never touches a published artifact.
    ///
    /// # Returns
    ///
    /// * `Ok(Dependencies)` - Initialized dependencies
    /// * `Err(IndexingError)` - If a spec is invalid or a connection fails
    ///   (OpenSearch only in fail-fast mode)
    pub async fn new() -> Result<Self, IndexingError> {
        let settings = Settings::from_env()?;
        Self::from_settings(settings).await
    }

    pub async fn from_settings(settings: Settings) -> Result<Self, IndexingError> {
        info!(
            opensearch_url = %settings.opensearch_url,
            connection_mode = ?settings.connection_mode,
            retry_interval_secs = settings.retry_interval.as_secs(),
            mode = %settings.rebuild_mode,
            index_alias = %settings.index_alias,
            "Initializing dependencies"
        );

        let view_specs = match settings.view_specs_dir {
            Some(ref dir) => spec_loader::load_view_specs_dir(dir)?,
            None => Vec::new(),
        };
        let template = match settings.document_template_path {
            Some(ref path) => {
                let template = spec_loader::load_document_template(path)?;
                spec_loader::check_index_patterns(
                    &template,
                    &IndexConfig::new(settings.index_alias.clone()),
                )?;
                Some(Arc::new(template))
            }
            None => None,
        };
        info!(
            views = view_specs.len(),
            index = template.is_some(),
            "Specifications loaded"
        );

        let pool = postgres::connect(&settings.database_url, DATABASE_MAX_CONNECTIONS)
            .await
            .map_err(|e| IndexingError::config(format!("Failed to connect to PostgreSQL: {}", e)))?;
        postgres::migrate(&pool)
            .await
            .map_err(|e| IndexingError::config(format!("Failed to run migrations: {}", e)))?;
        info!("PostgreSQL connection established");

        let mut orchestrator = Orchestrator::new(settings.rebuild_mode);

        if !view_specs.is_empty() {
            let store = PostgresViewStore::new(pool.clone(), settings.ddl_statement_timeout);
            let coordinator =
                ViewSwapCoordinator::with_config(Arc::new(store), settings.views.clone());
            orchestrator = orchestrator.with_views(Arc::new(coordinator), view_specs);
        }

        if let Some(template) = template {
            let query = match settings.source_query_path {
                Some(ref path) => read_query(path)?,
                None => {
                    return Err(IndexingError::config(
                        "SOURCE_QUERY_PATH is required when DOCUMENT_TEMPLATE_PATH is set",
                    ))
                }
            };

            let search_provider = Arc::new(
                Self::connect_to_opensearch(
                    &settings.opensearch_url,
                    BulkRequestConfig::with_max_batch_size(settings.pipeline.batch_size),
                    settings.connection_mode,
                    settings.retry_interval,
                )
                .await?,
            );
            info!("OpenSearch connection established");

            let loader = SearchLoader::with_config(search_provider.clone(), settings.loader.clone());
            let mut pipeline = IndexBuildPipeline::new(
                Arc::new(PostgresSourceReader::new(pool.clone())),
                Arc::new(loader),
                Arc::new(PostgresWatermarkRepository::new(pool.clone())),
                DocumentMapper::new(template.clone()),
                settings.pipeline.clone(),
                settings.watermark_id.clone(),
            );
            if let Some(ref path) = settings.deleted_ids_query_path {
                pipeline = pipeline.with_deleted_query(read_query(path)?);
            }

            let publisher = AliasSwapCoordinator::new(
                search_provider,
                IndexConfig::new(settings.index_alias.clone()),
                template,
                settings.publisher.clone(),
            );
            orchestrator = orchestrator.with_index(IndexRebuild {
                pipeline,
                publisher,
                query,
            });
        }

        Ok(Self { orchestrator })
    }

    /// Connect to OpenSearch with retry logic based on connection mode.
    async fn connect_to_opensearch(
        url: &str,
        bulk_config: BulkRequestConfig,
        mode: ConnectionMode,
        retry_interval: Duration,
    ) -> Result<OpenSearchProvider, IndexingError> {
        loop {
            match Self::try_connect_opensearch(url, bulk_config.clone()).await {
                Ok(provider) => return Ok(provider),
                Err(e) => match mode {
                    ConnectionMode::FailFast => {
                        return Err(IndexingError::config(format!(
                            "Failed to connect to OpenSearch: {}",
                            e
                        )));
                    }
                    ConnectionMode::Retry => {
                        warn!(
                            opensearch_url = %url,
                            error = %e,
                            retry_interval_secs = retry_interval.as_secs(),
                            "Failed to connect to OpenSearch, retrying..."
                        );
                        sleep(retry_interval).await;
                    }
                },
            }
        }
    }

    /// Attempt to connect to OpenSearch.
    async fn try_connect_opensearch(
        url: &str,
        bulk_config: BulkRequestConfig,
    ) -> Result<OpenSearchProvider, IndexingError> {
        let search_provider = OpenSearchProvider::new(url, bulk_config).map_err(|e| {
            IndexingError::config(format!("Failed to create OpenSearch provider: {}", e))
        })?;
        search_provider
            .ping()
            .await
            .map_err(|e| IndexingError::config(format!("OpenSearch is not reachable: {}", e)))?;

        Ok(search_provider)
    }
}

fn read_query(path: &Path) -> Result<String, IndexingError> {
    let query = fs::read_to_string(path).map_err(|e| {
        IndexingError::config(format!("Failed to read query '{}': {}", path.display(), e))
    })?;
    let query = query.trim().trim_end_matches(';').trim_end().to_string();
    if query.is_empty() {
        return Err(IndexingError::config(format!(
            "Query file '{}' is empty",
            path.display()
        )));
    }
    Ok(query)
}
