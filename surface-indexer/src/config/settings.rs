//! Typed settings read from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use surface_indexer_shared::RebuildMode;

use super::ConnectionMode;
use crate::loader::LoaderConfig;
use crate::pipeline::PipelineConfig;
use crate::publisher::PublisherConfig;
use crate::views::ViewSwapConfig;
use crate::IndexingError;

/// Default OpenSearch URL.
const DEFAULT_OPENSEARCH_URL: &str = "http://localhost:9200";

/// Default connection retry interval in seconds.
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15;

/// Default stable alias of the search index.
const DEFAULT_INDEX_ALIAS: &str = "transactions";

/// Default server-side timeout of one DDL statement.
const DEFAULT_DDL_STATEMENT_TIMEOUT_SECS: u64 = 3600;

/// Everything one invocation needs to know.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub opensearch_url: String,
    pub connection_mode: ConnectionMode,
    pub retry_interval: Duration,
    /// Directory of view spec files; `None` disables view rebuilds.
    pub view_specs_dir: Option<PathBuf>,
    /// Document template; `None` disables the index rebuild.
    pub document_template_path: Option<PathBuf>,
    pub source_query_path: Option<PathBuf>,
    pub deleted_ids_query_path: Option<PathBuf>,
    pub index_alias: String,
    pub rebuild_mode: RebuildMode,
    pub watermark_id: String,
    pub ddl_statement_timeout: Duration,
    pub pipeline: PipelineConfig,
    pub loader: LoaderConfig,
    pub publisher: PublisherConfig,
    pub views: ViewSwapConfig,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, IndexingError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through `lookup`, which returns the raw value of a variable.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection string (required)
    /// - `OPENSEARCH_URL`: OpenSearch server URL (default: http://localhost:9200)
    /// - `OPENSEARCH_CONNECTION_MODE`: "fail-fast" or "retry" (default: retry)
    /// - `OPENSEARCH_RETRY_INTERVAL_SECS`: Retry interval in seconds (default: 15)
    /// - `VIEW_SPECS_DIR`, `DOCUMENT_TEMPLATE_PATH`, `SOURCE_QUERY_PATH`,
    ///   `DELETED_IDS_QUERY_PATH`: spec and query files
    /// - `INDEX_ALIAS` (default: transactions), `REBUILD_MODE` (default: full),
    ///   `WATERMARK_ID` (default: the alias)
    /// - `BATCH_SIZE`, `MAX_IN_FLIGHT_BATCHES`, `BULK_MAX_ATTEMPTS`,
    ///   `BULK_BACKOFF_BASE_MS`, `BULK_BACKOFF_MAX_SECS`, `DOCUMENT_MAX_RETRIES`,
    ///   `BULK_TIMEOUT_SECS`, `DDL_STATEMENT_TIMEOUT_SECS`, `MAX_FAILED_DOCUMENTS`,
    ///   `VERIFY_DOCUMENT_COUNT`, `VIEW_MIN_ROWS`, `VIEW_MAX_SHRINK_RATIO`
    /// - `SNAPSHOT_REPOSITORY`: snapshot repository for published generations
    ///   (default: none, no snapshot)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, IndexingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url =
            var("DATABASE_URL").ok_or_else(|| IndexingError::config("DATABASE_URL is required"))?;
        let opensearch_url =
            var("OPENSEARCH_URL").unwrap_or_else(|| DEFAULT_OPENSEARCH_URL.to_string());
        let connection_mode = ConnectionMode::parse(var("OPENSEARCH_CONNECTION_MODE").as_deref());
        let retry_interval = Duration::from_secs(parse_or(
            &var,
            "OPENSEARCH_RETRY_INTERVAL_SECS",
            DEFAULT_RETRY_INTERVAL_SECS,
        )?);

        let view_specs_dir = var("VIEW_SPECS_DIR").map(PathBuf::from);
        let document_template_path = var("DOCUMENT_TEMPLATE_PATH").map(PathBuf::from);
        let source_query_path = var("SOURCE_QUERY_PATH").map(PathBuf::from);
        let deleted_ids_query_path = var("DELETED_IDS_QUERY_PATH").map(PathBuf::from);
        if document_template_path.is_some() && source_query_path.is_none() {
            return Err(IndexingError::config(
                "SOURCE_QUERY_PATH is required when DOCUMENT_TEMPLATE_PATH is set",
            ));
        }

        let index_alias = var("INDEX_ALIAS").unwrap_or_else(|| DEFAULT_INDEX_ALIAS.to_string());
        let rebuild_mode = match var("REBUILD_MODE") {
            Some(raw) => RebuildMode::from_str(&raw).map_err(IndexingError::config)?,
            None => RebuildMode::Full,
        };
        let watermark_id = var("WATERMARK_ID").unwrap_or_else(|| index_alias.clone());

        let pipeline_defaults = PipelineConfig::default();
        let loader_defaults = LoaderConfig::default();
        let publisher_defaults = PublisherConfig::default();
        let view_defaults = ViewSwapConfig::default();

        let max_failed_documents = parse_or(
            &var,
            "MAX_FAILED_DOCUMENTS",
            pipeline_defaults.max_failed_documents,
        )?;
        let pipeline = PipelineConfig {
            batch_size: parse_or(&var, "BATCH_SIZE", pipeline_defaults.batch_size)?,
            max_in_flight: parse_or(&var, "MAX_IN_FLIGHT_BATCHES", pipeline_defaults.max_in_flight)?,
            max_failed_documents,
        };
        if pipeline.batch_size == 0 || pipeline.max_in_flight == 0 {
            return Err(IndexingError::config(
                "BATCH_SIZE and MAX_IN_FLIGHT_BATCHES must be positive",
            ));
        }

        let loader = LoaderConfig {
            max_attempts: parse_or(&var, "BULK_MAX_ATTEMPTS", loader_defaults.max_attempts)?,
            backoff_base_ms: parse_or(&var, "BULK_BACKOFF_BASE_MS", loader_defaults.backoff_base_ms)?,
            backoff_max: Duration::from_secs(parse_or(
                &var,
                "BULK_BACKOFF_MAX_SECS",
                loader_defaults.backoff_max.as_secs(),
            )?),
            document_max_retries: parse_or(
                &var,
                "DOCUMENT_MAX_RETRIES",
                loader_defaults.document_max_retries,
            )?,
            bulk_timeout: Duration::from_secs(parse_or(
                &var,
                "BULK_TIMEOUT_SECS",
                loader_defaults.bulk_timeout.as_secs(),
            )?),
        };

        let publisher = PublisherConfig {
            max_failed_documents,
            verify_document_count: parse_or(
                &var,
                "VERIFY_DOCUMENT_COUNT",
                publisher_defaults.verify_document_count,
            )?,
            snapshot_repository: var("SNAPSHOT_REPOSITORY"),
        };

        let max_shrink_ratio = match var("VIEW_MAX_SHRINK_RATIO") {
            Some(raw) => {
                let ratio: f64 = parse_value("VIEW_MAX_SHRINK_RATIO", &raw)?;
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(IndexingError::config(format!(
                        "VIEW_MAX_SHRINK_RATIO must be in (0, 1], got {}",
                        ratio
                    )));
                }
                Some(ratio)
            }
            None => view_defaults.max_shrink_ratio,
        };
        let views = ViewSwapConfig {
            min_rows: parse_or(&var, "VIEW_MIN_ROWS", view_defaults.min_rows)?,
            max_shrink_ratio,
            ..view_defaults
        };

        Ok(Self {
            database_url,
            opensearch_url,
            connection_mode,
            retry_interval,
            view_specs_dir,
            document_template_path,
            source_query_path,
            deleted_ids_query_path,
            index_alias,
            rebuild_mode,
            watermark_id,
            ddl_statement_timeout: Duration::from_secs(parse_or(
                &var,
                "DDL_STATEMENT_TIMEOUT_SECS",
                DEFAULT_DDL_STATEMENT_TIMEOUT_SECS,
            )?),
            pipeline,
            loader,
            publisher,
            views,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, IndexingError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, IndexingError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| IndexingError::config(format!("Invalid {} '{}': {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, IndexingError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[("DATABASE_URL", "postgres://localhost/data_store")]).unwrap();

        assert_eq!(settings.opensearch_url, "http://localhost:9200");
        assert_eq!(settings.connection_mode, ConnectionMode::Retry);
        assert_eq!(settings.retry_interval, Duration::from_secs(15));
        assert_eq!(settings.index_alias, "transactions");
        assert_eq!(settings.watermark_id, "transactions");
        assert_eq!(settings.rebuild_mode, RebuildMode::Full);
        assert_eq!(settings.pipeline.batch_size, 2000);
        assert_eq!(settings.pipeline.max_in_flight, 2);
        assert_eq!(settings.loader.max_attempts, 5);
        assert_eq!(settings.loader.backoff_max, Duration::from_secs(30));
        assert_eq!(settings.loader.bulk_timeout, Duration::from_secs(60));
        assert_eq!(settings.ddl_statement_timeout, Duration::from_secs(3600));
        assert_eq!(settings.publisher.max_failed_documents, 0);
        assert!(settings.publisher.verify_document_count);
        assert!(settings.publisher.snapshot_repository.is_none());
        assert_eq!(settings.views.min_rows, 1);
        assert_eq!(settings.views.max_shrink_ratio, None);
        assert!(settings.view_specs_dir.is_none());
        assert!(settings.document_template_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = settings(&[
            ("DATABASE_URL", "postgres://localhost/data_store"),
            ("OPENSEARCH_CONNECTION_MODE", "fail-fast"),
            ("INDEX_ALIAS", "awards"),
            ("WATERMARK_ID", "awards-incremental"),
            ("REBUILD_MODE", "Incremental"),
            ("DOCUMENT_TEMPLATE_PATH", "/etc/surface/template.json"),
            ("SOURCE_QUERY_PATH", "/etc/surface/awards.sql"),
            ("BATCH_SIZE", "500"),
            ("MAX_FAILED_DOCUMENTS", "10"),
            ("VERIFY_DOCUMENT_COUNT", "false"),
            ("VIEW_MAX_SHRINK_RATIO", "0.5"),
            ("SNAPSHOT_REPOSITORY", "s3-backups"),
        ])
        .unwrap();

        assert_eq!(settings.connection_mode, ConnectionMode::FailFast);
        assert_eq!(settings.index_alias, "awards");
        assert_eq!(settings.watermark_id, "awards-incremental");
        assert_eq!(settings.rebuild_mode, RebuildMode::Incremental);
        assert_eq!(settings.pipeline.batch_size, 500);
        assert_eq!(settings.pipeline.max_failed_documents, 10);
        assert_eq!(settings.publisher.max_failed_documents, 10);
        assert!(!settings.publisher.verify_document_count);
        assert_eq!(settings.views.max_shrink_ratio, Some(0.5));
        assert_eq!(settings.publisher.snapshot_repository.as_deref(), Some("s3-backups"));
    }

    #[test]
    fn test_missing_database_url() {
        assert!(matches!(settings(&[]), Err(IndexingError::ConfigError(_))));
    }

    #[test]
    fn test_template_requires_source_query() {
        let result = settings(&[
            ("DATABASE_URL", "postgres://localhost/data_store"),
            ("DOCUMENT_TEMPLATE_PATH", "/etc/surface/template.json"),
        ]);
        assert!(matches!(result, Err(IndexingError::ConfigError(_))));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        for (key, value) in [
            ("BATCH_SIZE", "many"),
            ("BATCH_SIZE", "0"),
            ("REBUILD_MODE", "partial"),
            ("VIEW_MAX_SHRINK_RATIO", "1.5"),
        ] {
            let result = settings(&[("DATABASE_URL", "postgres://localhost/db"), (key, value)]);
            assert!(result.is_err(), "{}={} should be rejected", key, value);
        }
    }
}
