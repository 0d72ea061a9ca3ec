//! Source rows and search documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row returned by the source query, keyed by column name in projection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRow {
    columns: Map<String, Value>,
}

impl SourceRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self { columns }
    }

    /// Parse a row rendered by `row_to_json`.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Value of a column; missing columns read as `None`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Value of a column, treating JSON null as absent.
    pub fn get_non_null(&self, column: &str) -> Option<&Value> {
        self.columns.get(column).filter(|v| !v.is_null())
    }

    pub fn columns(&self) -> &Map<String, Value> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for SourceRow {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// A search document ready for bulk submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id (the template's `id_field` rendered as text).
    pub id: String,
    /// Field-keyed body, in template order.
    pub source: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, source: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}
