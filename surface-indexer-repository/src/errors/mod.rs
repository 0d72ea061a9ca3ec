//! Error types for the surface indexer repository.
//!
//! Each boundary has its own error type; every type can tell whether a failure
//! is transient so callers know what is worth retrying.

mod search_index_error;
mod source_error;
mod view_store_error;
mod watermark_error;

pub use search_index_error::SearchIndexError;
pub use source_error::SourceError;
pub use view_store_error::ViewStoreError;
pub use watermark_error::WatermarkRepositoryError;

/// SQLSTATE codes worth retrying: statement timeout / cancel, serialization
/// failure, deadlock and lock timeout.
pub(crate) const TRANSIENT_SQLSTATES: &[&str] = &["57014", "40001", "40P01", "55P03"];

/// Whether a database error is worth retrying.
pub(crate) fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}
