//! Request and response types for the repository boundaries.

use serde_json::{json, Value};
use surface_indexer_shared::Marker;

use crate::errors::SearchIndexError;

/// Result of a bulk operation for a single document.
///
/// Indicates whether the engine accepted the document and, if not, the status
/// and reason it gave.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    /// The document id.
    pub id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// HTTP status reported for the item.
    pub status: u16,
    /// Error reason if the operation failed.
    pub error: Option<String>,
}

impl BulkItemResult {
    /// Whether the rejection is worth retrying on its own (e.g. queue full).
    pub fn is_retryable(&self) -> bool {
        !self.success && matches!(self.status, 429 | 502 | 503 | 504)
    }
}

/// Summary of a bulk operation containing aggregate statistics and individual results.
///
/// Lets callers handle partial failures: a bulk request the engine accepted as a
/// whole may still have rejected some of its documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSummary {
    /// Total number of items in the batch.
    pub total: usize,
    /// Number of successful operations.
    pub succeeded: usize,
    /// Number of failed operations.
    pub failed: usize,
    /// Individual results for each item, in request order.
    pub results: Vec<BulkItemResult>,
}

impl BulkSummary {
    /// Build a summary from per-item results.
    pub fn from_results(results: Vec<BulkItemResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    /// Items the engine rejected.
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// One step of an atomic alias update.
#[derive(Debug, Clone, PartialEq)]
pub enum AliasAction {
    /// Point `alias` at `index`, optionally restricted by a query filter.
    Add {
        index: String,
        alias: String,
        filter: Option<Value>,
    },
    /// Detach `alias` from `index`.
    Remove { index: String, alias: String },
}

impl AliasAction {
    pub fn add(index: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Add {
            index: index.into(),
            alias: alias.into(),
            filter: None,
        }
    }

    pub fn add_filtered(index: impl Into<String>, alias: impl Into<String>, filter: Value) -> Self {
        Self::Add {
            index: index.into(),
            alias: alias.into(),
            filter: Some(filter),
        }
    }

    pub fn remove(index: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Remove {
            index: index.into(),
            alias: alias.into(),
        }
    }

    /// Render the action in `_aliases` request form.
    pub fn to_json(&self) -> Result<Value, SearchIndexError> {
        match self {
            Self::Add {
                index,
                alias,
                filter,
            } => {
                if index.is_empty() || alias.is_empty() {
                    return Err(SearchIndexError::validation(
                        "Alias actions need an index and an alias",
                    ));
                }
                let mut body = json!({ "index": index, "alias": alias });
                if let Some(filter) = filter {
                    body["filter"] = filter.clone();
                }
                Ok(json!({ "add": body }))
            }
            Self::Remove { index, alias } => {
                if index.is_empty() || alias.is_empty() {
                    return Err(SearchIndexError::validation(
                        "Alias actions need an index and an alias",
                    ));
                }
                Ok(json!({ "remove": { "index": index, "alias": alias } }))
            }
        }
    }
}

/// A source query with its incremental restriction.
///
/// Every row comes back as one JSON object (`row_to_json`), so column names and
/// order are preserved without knowing the query's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    /// The query, without a trailing semicolon.
    pub sql: String,
    /// Column holding the modification marker.
    pub marker_column: Option<String>,
    /// Only rows whose marker is strictly greater are returned.
    pub after: Option<Marker>,
}

impl SourceQuery {
    /// A query returning every row.
    pub fn full(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            marker_column: None,
            after: None,
        }
    }

    /// A query returning rows changed after `after` (all rows when `None`),
    /// ordered by the marker column.
    pub fn changed_since(
        sql: impl Into<String>,
        marker_column: impl Into<String>,
        after: Option<Marker>,
    ) -> Self {
        Self {
            sql: sql.into(),
            marker_column: Some(marker_column.into()),
            after,
        }
    }

    /// The wrapped statement a cursor is declared for.
    pub fn render(&self) -> String {
        let inner = self.sql.trim().trim_end_matches(';').trim_end();
        let mut sql = format!("SELECT row_to_json(src)::text FROM ({}) AS src", inner);
        if let Some(ref column) = self.marker_column {
            if let Some(ref after) = self.after {
                sql.push_str(&format!(
                    " WHERE src.\"{}\" > {}",
                    column,
                    after.to_sql_literal()
                ));
            }
            sql.push_str(&format!(" ORDER BY src.\"{}\"", column));
        }
        sql
    }
}
