//! Errors raised while running view DDL.

use thiserror::Error;

use super::is_transient_sqlx;

/// Errors from [`crate::interfaces::ViewStore`] operations.
#[derive(Debug, Error)]
pub enum ViewStoreError {
    /// A statement failed; `label` names the step (`create view`, `create index foo`, ...).
    #[error("Statement '{label}' failed: {source}")]
    Statement {
        label: String,
        #[source]
        source: sqlx::Error,
    },

    /// The swap transaction failed and was rolled back.
    #[error("Swap of '{view}' failed: {source}")]
    Swap {
        view: String,
        #[source]
        source: sqlx::Error,
    },

    /// An in-place rewrite produced row counts the guard refused; it was rolled back.
    #[error("Rewrite of '{view}' rejected: {reason}")]
    Rejected { view: String, reason: String },

    /// Catalog lookups or pool errors.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ViewStoreError {
    pub fn statement(label: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Statement {
            label: label.into(),
            source,
        }
    }

    /// Whether re-running the failed step may succeed (statement timeout,
    /// serialization failure, deadlock, lost connection).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Statement { source, .. } | Self::Swap { source, .. } | Self::Database(source) => {
                is_transient_sqlx(source)
            }
            Self::Rejected { .. } => false,
        }
    }
}
