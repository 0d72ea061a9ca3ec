//! # Surface Indexer Repository
//!
//! This crate provides the boundary traits the rebuild pipelines talk to, the
//! errors they raise, and concrete implementations for PostgreSQL (source rows,
//! materialized views, watermarks) and OpenSearch (index generations and aliases).

pub mod config;
pub mod errors;
pub mod interfaces;
pub mod opensearch;
pub mod postgres;
pub mod types;

pub use config::BulkRequestConfig;
pub use errors::{SearchIndexError, SourceError, ViewStoreError, WatermarkRepositoryError};
pub use interfaces::{RowCursor, SearchIndexProvider, SourceReader, ViewStore, WatermarkRepository};
pub use opensearch::OpenSearchProvider;
pub use postgres::{PostgresSourceReader, PostgresViewStore, PostgresWatermarkRepository};
pub use types::{AliasAction, BulkItemResult, BulkSummary, SourceQuery};
