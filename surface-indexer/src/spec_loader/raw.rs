//! Input shapes of the declarative specification files.
//!
//! These mirror the JSON as written; [`super`] validates them into the typed
//! objects of `surface_indexer_shared`.

use serde::Deserialize;
use serde_json::{Map, Number, Value};

#[derive(Debug, Deserialize)]
pub(crate) struct RawViewSpec {
    pub final_name: String,
    #[serde(default)]
    pub refresh: bool,
    pub matview_sql: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<RawIndexSpec>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub identity_source: Option<String>,
    #[serde(default)]
    pub grant_select: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawIndexSpec {
    pub name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    pub columns: Vec<RawIndexColumn>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawIndexColumn {
    pub name: String,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub nulls: Option<String>,
    #[serde(default)]
    pub opclass: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawDocumentTemplate {
    pub index_patterns: Vec<String>,
    #[serde(default)]
    pub settings: RawSettings,
    #[serde(default)]
    pub sort: Option<RawSort>,
    /// Kept as an ordered map so field order survives parsing.
    pub mappings: Map<String, Value>,
    pub id_field: String,
    #[serde(default)]
    pub marker_field: Option<String>,
    #[serde(default)]
    pub aliases: Vec<RawAlias>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct RawSettings {
    pub refresh_interval: String,
    pub shards: u32,
    pub replicas: u32,
    pub analysis: Option<Map<String, Value>>,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            refresh_interval: "1s".to_string(),
            shards: 1,
            replicas: 0,
            analysis: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSort {
    pub fields: Vec<String>,
    pub order: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawAlias {
    pub suffix: String,
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawFieldMapping {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub scaling_factor: Option<Number>,
    #[serde(default)]
    pub analyzer: Option<String>,
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub zero_pad: Option<usize>,
    #[serde(default)]
    pub concat: Vec<String>,
}
