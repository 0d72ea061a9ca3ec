//! Errors raised while reading source rows.

use thiserror::Error;

use super::is_transient_sqlx;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be decoded into a column map.
    #[error("Malformed source row: {0}")]
    MalformedRow(String),

    /// The cursor was used after it was closed.
    #[error("Cursor already closed")]
    Closed,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}
