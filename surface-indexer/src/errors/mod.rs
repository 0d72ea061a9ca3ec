//! Error types for the surface indexer.

use surface_indexer_repository::{
    SearchIndexError, SourceError, ViewStoreError, WatermarkRepositoryError,
};
use thiserror::Error;

/// Errors that can occur while loading specifications or rebuilding a surface.
///
/// Every fatal variant leaves the previously published view or index generation
/// untouched. `DocumentMapping` is per document: the pipeline counts it as a
/// skipped row and carries on.
#[derive(Error, Debug)]
pub enum RebuildError {
    /// A specification is missing required fields or has the wrong shape.
    #[error("Spec parse error: {0}")]
    SpecParse(String),

    /// A specification parsed but is inconsistent.
    #[error("Spec validation error: {0}")]
    SpecValidation(String),

    /// A DDL statement failed; the generation being built was discarded.
    #[error("DDL execution error on '{view}': {message}")]
    DdlExecution { view: String, message: String },

    /// A rebuild of the same view is already running.
    #[error("Rebuild already in progress for '{0}'")]
    RebuildInProgress(String),

    /// The search engine was unavailable or overloaded.
    #[error("Transient write failure: {0}")]
    TransientWriteFailure(String),

    /// One row could not be turned into a document.
    #[error("Document mapping failure{}: {message}", .id.as_ref().map(|i| format!(" for '{}'", i)).unwrap_or_default())]
    DocumentMapping { id: Option<String>, message: String },

    /// The index rebuild was stopped; the published generation is unaffected.
    #[error("Index build aborted: {0}")]
    IndexBuildAborted(String),

    /// The watermark could not be read or advanced.
    #[error("Watermark persistence error: {0}")]
    WatermarkPersistence(String),

    /// A freshly built view generation failed the sanity check.
    #[error("Validation failed for '{view}': {message}")]
    ValidationFailed { view: String, message: String },

    /// The run was cancelled between batches.
    #[error("Rebuild cancelled")]
    Cancelled,

    /// Reading source rows failed.
    #[error("Source error: {0}")]
    Source(String),

    /// Index, alias or settings operation failed.
    #[error("Search index error: {0}")]
    SearchIndex(#[from] SearchIndexError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RebuildError {
    /// Create a spec parse error.
    pub fn spec_parse(msg: impl Into<String>) -> Self {
        Self::SpecParse(msg.into())
    }

    /// Create a spec validation error.
    pub fn spec_validation(msg: impl Into<String>) -> Self {
        Self::SpecValidation(msg.into())
    }

    /// Create a DDL execution error.
    pub fn ddl(view: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DdlExecution {
            view: view.into(),
            message: msg.into(),
        }
    }

    /// Create a document mapping error.
    pub fn mapping(id: Option<String>, msg: impl Into<String>) -> Self {
        Self::DocumentMapping {
            id,
            message: msg.into(),
        }
    }

    /// Create an index build aborted error.
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::IndexBuildAborted(msg.into())
    }

    /// Create a validation failure.
    pub fn validation_failed(view: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ValidationFailed {
            view: view.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error rejected a duplicate request rather than failing a rebuild.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RebuildInProgress(_))
    }
}

impl From<SourceError> for RebuildError {
    fn from(err: SourceError) -> Self {
        Self::Source(err.to_string())
    }
}

impl From<WatermarkRepositoryError> for RebuildError {
    fn from(err: WatermarkRepositoryError) -> Self {
        Self::WatermarkPersistence(err.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for RebuildError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        Self::SpecValidation(format!("SQL does not parse: {}", err))
    }
}

impl RebuildError {
    /// Wrap a view store failure for the given view.
    ///
    /// A rewrite the store rolled back on its row-count guard is a validation failure.
    pub fn from_view_store(view: &str, err: ViewStoreError) -> Self {
        match err {
            ViewStoreError::Rejected { reason, .. } => Self::validation_failed(view, reason),
            other => Self::ddl(view, other.to_string()),
        }
    }
}
