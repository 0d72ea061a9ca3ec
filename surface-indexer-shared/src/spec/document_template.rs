//! Typed search document template.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::view_spec::SortDirection;

/// A validated document template.
///
/// Field mappings keep their declaration order: composite fields and document
/// output are produced in that order so rebuilds are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTemplate {
    /// Index name patterns generations must match (`*` wildcards).
    pub index_patterns: Vec<String>,
    pub settings: IndexSettings,
    pub sort: Option<IndexSort>,
    /// Field name and mapping, in declaration order.
    pub fields: Vec<(String, FieldMapping)>,
    /// Source column giving the document id.
    pub id_field: String,
    /// Source column carrying the modification marker used by incremental runs.
    pub marker_field: Option<String>,
    /// Filtered aliases attached to every published generation.
    pub aliases: Vec<FilteredAlias>,
}

/// Index-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub refresh_interval: String,
    pub shards: u32,
    pub replicas: u32,
    /// Analysis section (`analyzer`, `filter`, optional `tokenizer`), passed through as JSON.
    pub analysis: Option<Map<String, Value>>,
}

/// Index sorting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSort {
    pub fields: Vec<String>,
    pub order: Vec<SortDirection>,
}

/// Alias `<alias>-<suffix>` filtered to documents whose `field` is one of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredAlias {
    pub suffix: String,
    pub field: String,
    pub values: Vec<String>,
}

/// Supported storage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Keyword,
    Date,
    ScaledFloat,
    Nested,
    Object,
    Long,
    Integer,
    Boolean,
}

impl FieldType {
    /// Parse a mapping `type`, returning `None` for unsupported types.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "keyword" => Some(Self::Keyword),
            "date" => Some(Self::Date),
            "scaled_float" => Some(Self::ScaledFloat),
            "nested" => Some(Self::Nested),
            "object" => Some(Self::Object),
            "long" => Some(Self::Long),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Keyword => "keyword",
            Self::Date => "date",
            Self::ScaledFloat => "scaled_float",
            Self::Nested => "nested",
            Self::Object => "object",
            Self::Long => "long",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    /// Whether values are strings (eligible for padding and concatenation).
    pub fn is_string(&self) -> bool {
        matches!(self, Self::Text | Self::Keyword)
    }

    /// Whether the field contains sub-documents.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Nested | Self::Object)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping of one document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field_type: FieldType,
    pub format: Option<String>,
    pub scaling_factor: Option<u64>,
    pub analyzer: Option<String>,
    /// Derived sub-fields (e.g. an exact-match `keyword` under a `text` field).
    pub sub_fields: Vec<(String, FieldMapping)>,
    /// Properties of `nested`/`object` fields.
    pub properties: Vec<(String, FieldMapping)>,
    /// Source column when it differs from the field name.
    pub source: Option<String>,
    /// Fixed width of a zero-padded geographic code.
    pub zero_pad: Option<usize>,
    /// Source columns concatenated, in order, into a composite text field.
    pub concat: Vec<String>,
}

impl FieldMapping {
    /// A bare mapping of the given type.
    pub fn of_type(field_type: FieldType) -> Self {
        Self {
            field_type,
            format: None,
            scaling_factor: None,
            analyzer: None,
            sub_fields: Vec::new(),
            properties: Vec::new(),
            source: None,
            zero_pad: None,
            concat: Vec::new(),
        }
    }

    /// The source column the field is read from.
    pub fn source_column<'a>(&'a self, field_name: &'a str) -> &'a str {
        self.source.as_deref().unwrap_or(field_name)
    }

    /// Render the search-engine mapping of this field.
    ///
    /// Scaled floats are stored as their scaled integer, so they map to `long`
    /// with the factor recorded in the field metadata.
    pub fn to_mapping(&self) -> Value {
        let mut mapping = Map::new();
        match self.field_type {
            FieldType::ScaledFloat => {
                mapping.insert("type".to_string(), json!("long"));
                if let Some(factor) = self.scaling_factor {
                    mapping.insert(
                        "meta".to_string(),
                        json!({ "scaling_factor": factor.to_string() }),
                    );
                }
            }
            other => {
                mapping.insert("type".to_string(), json!(other.as_str()));
            }
        }
        if let Some(ref format) = self.format {
            mapping.insert("format".to_string(), json!(format));
        }
        if let Some(ref analyzer) = self.analyzer {
            mapping.insert("analyzer".to_string(), json!(analyzer));
        }
        if !self.sub_fields.is_empty() {
            mapping.insert("fields".to_string(), Value::Object(render_fields(&self.sub_fields)));
        }
        if !self.properties.is_empty() {
            mapping.insert(
                "properties".to_string(),
                Value::Object(render_fields(&self.properties)),
            );
        }
        Value::Object(mapping)
    }
}

fn render_fields(fields: &[(String, FieldMapping)]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, mapping)| (name.clone(), mapping.to_mapping()))
        .collect()
}

impl DocumentTemplate {
    /// Look up a top-level field mapping by name.
    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, mapping)| mapping)
    }

    /// The `mappings` section of the index body.
    pub fn mappings(&self) -> Value {
        json!({
            "dynamic": false,
            "properties": Value::Object(render_fields(&self.fields)),
        })
    }

    /// Settings applied when a generation is created.
    ///
    /// Refreshes and replicas are disabled while the generation is loaded; the
    /// template values are applied by [`DocumentTemplate::final_settings`].
    pub fn build_settings(&self) -> Value {
        let mut index = Map::new();
        index.insert("number_of_shards".to_string(), json!(self.settings.shards));
        index.insert("number_of_replicas".to_string(), json!(0));
        index.insert("refresh_interval".to_string(), json!("-1"));
        if let Some(ref sort) = self.sort {
            index.insert("sort.field".to_string(), json!(sort.fields));
            index.insert(
                "sort.order".to_string(),
                json!(sort.order.iter().map(|o| o.as_str()).collect::<Vec<_>>()),
            );
        }

        let mut settings = Map::new();
        settings.insert("index".to_string(), Value::Object(index));
        if let Some(ref analysis) = self.settings.analysis {
            settings.insert("analysis".to_string(), Value::Object(analysis.clone()));
        }
        Value::Object(settings)
    }

    /// Settings applied to a generation right before it is published.
    pub fn final_settings(&self) -> Value {
        json!({
            "index": {
                "number_of_replicas": self.settings.replicas,
                "refresh_interval": self.settings.refresh_interval,
            }
        })
    }

    /// Full create-index request body for a new generation.
    pub fn index_body(&self) -> Value {
        json!({
            "settings": self.build_settings(),
            "mappings": self.mappings(),
        })
    }
}
