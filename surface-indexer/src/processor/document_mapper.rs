//! Document mapper implementation.
//!
//! Turns rows of the source query into documents shaped by the document
//! template. Mapping is a pure function of the row and the template.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use surface_indexer_shared::{
    Document, DocumentTemplate, FieldMapping, FieldType, Marker, ScaledFloat, SourceRow,
};
use tracing::{debug, instrument, warn};

use crate::errors::RebuildError;

lazy_static! {
    static ref GEO_CODE_REGEXP: Regex = Regex::new(r"^[A-Z]*(\d+)(?:\.\d+)?$").unwrap();
}

/// Documents produced from one batch of rows.
#[derive(Debug, Default)]
pub struct MappedBatch {
    pub documents: Vec<Document>,
    /// Rows that could not be mapped.
    pub skipped: u64,
    /// Highest marker among all rows of the batch, skipped ones included.
    pub max_marker: Option<Marker>,
}

/// Maps source rows with a fixed template.
#[derive(Debug, Clone)]
pub struct DocumentMapper {
    template: Arc<DocumentTemplate>,
}

impl DocumentMapper {
    pub fn new(template: Arc<DocumentTemplate>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &DocumentTemplate {
        &self.template
    }

    /// Map a batch, skipping rows that fail.
    ///
    /// A row that cannot be mapped is logged and counted; it never fails the batch.
    #[instrument(skip(self, rows), fields(row_count = rows.len()))]
    pub fn map_batch(&self, rows: Vec<SourceRow>) -> MappedBatch {
        let mut batch = MappedBatch {
            documents: Vec::with_capacity(rows.len()),
            ..Default::default()
        };

        for row in rows {
            let marker = self.row_marker(&row);
            batch.max_marker = Marker::max_of(batch.max_marker.take(), marker);

            match map_row(&row, &self.template) {
                Ok(document) => batch.documents.push(document),
                Err(e) => {
                    warn!(error = %e, "Skipping row that could not be mapped");
                    batch.skipped += 1;
                }
            }
        }

        debug!(
            documents = batch.documents.len(),
            skipped = batch.skipped,
            "Mapped row batch"
        );
        batch
    }

    fn row_marker(&self, row: &SourceRow) -> Option<Marker> {
        let column = self.template.marker_field.as_deref()?;
        row.get_non_null(column).and_then(Marker::from_value)
    }
}

/// Map one row to a document.
///
/// Only template fields are emitted, in template order; a null or missing
/// source value becomes JSON null.
pub fn map_row(row: &SourceRow, template: &DocumentTemplate) -> Result<Document, RebuildError> {
    let id = match row.get_non_null(&template.id_field) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(RebuildError::mapping(
                None,
                format!("id field '{}' holds {}", template.id_field, other),
            ));
        }
        None => {
            return Err(RebuildError::mapping(
                None,
                format!("id field '{}' is missing", template.id_field),
            ));
        }
    };

    let source = map_fields(&template.fields, row)
        .map_err(|message| RebuildError::mapping(Some(id.clone()), message))?;
    Ok(Document::new(id, source))
}

fn map_fields(
    fields: &[(String, FieldMapping)],
    row: &SourceRow,
) -> Result<Map<String, Value>, String> {
    let mut source = Map::with_capacity(fields.len());
    for (name, mapping) in fields {
        source.insert(name.clone(), map_field(name, mapping, row)?);
    }
    Ok(source)
}

fn map_field(name: &str, mapping: &FieldMapping, row: &SourceRow) -> Result<Value, String> {
    if !mapping.concat.is_empty() {
        return Ok(concat_columns(&mapping.concat, row));
    }

    let column = mapping.source_column(name);
    let raw = match row.get_non_null(column) {
        Some(value) => value,
        None => return Ok(Value::Null),
    };

    match mapping.field_type {
        FieldType::ScaledFloat => {
            let codec = ScaledFloat::new(mapping.scaling_factor.unwrap_or(1))
                .map_err(|e| format!("field '{}': {}", name, e))?;
            codec
                .encode_value(raw)
                .map(Value::from)
                .map_err(|e| format!("field '{}': {}", name, e))
        }
        FieldType::Long => to_i64(raw)
            .map(Value::from)
            .ok_or_else(|| format!("field '{}': {} is not an integer", name, raw)),
        FieldType::Integer => to_i64(raw)
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::from)
            .ok_or_else(|| format!("field '{}': {} is not a 32-bit integer", name, raw)),
        FieldType::Boolean => to_bool(raw)
            .map(Value::Bool)
            .ok_or_else(|| format!("field '{}': {} is not a boolean", name, raw)),
        FieldType::Keyword | FieldType::Text => Ok(map_string_field(name, mapping, raw)),
        FieldType::Nested | FieldType::Object => {
            let value = match raw {
                Value::String(s) if s.trim().is_empty() => return Ok(Value::Null),
                Value::String(s) => serde_json::from_str(s).map_err(|e| {
                    format!("field '{}': embedded JSON does not parse: {}", name, e)
                })?,
                other => other.clone(),
            };
            map_container(name, mapping, value)
        }
        FieldType::Date => Ok(raw.clone()),
    }
}

/// Apply the declared properties to each sub-document of a container field.
///
/// Without declared properties the value passes through unchanged.
fn map_container(name: &str, mapping: &FieldMapping, value: Value) -> Result<Value, String> {
    if mapping.properties.is_empty() {
        return Ok(value);
    }
    let map_object = |item: Value| -> Result<Value, String> {
        match item {
            Value::Null => Ok(Value::Null),
            Value::Object(columns) => map_fields(&mapping.properties, &SourceRow::new(columns))
                .map(Value::Object)
                .map_err(|e| format!("field '{}': {}", name, e)),
            other => Err(format!("field '{}': {} is not an object", name, other)),
        }
    };
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(map_object)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => map_object(other),
    }
}

fn map_string_field(name: &str, mapping: &FieldMapping, raw: &Value) -> Value {
    if let Some(width) = mapping.zero_pad {
        let text = text_of(raw);
        return match extract_geo_code(&text, width) {
            Some(code) => Value::String(code),
            None => {
                debug!(field = %name, value = %text, "Code has no digits to extract, mapping to null");
                Value::Null
            }
        };
    }

    if mapping.field_type == FieldType::Keyword {
        if let Value::String(s) = raw {
            if let Some(items) = parse_postgres_array(s) {
                return if items.is_empty() {
                    Value::Null
                } else {
                    Value::Array(items)
                };
            }
        }
    }
    raw.clone()
}

fn concat_columns(columns: &[String], row: &SourceRow) -> Value {
    let parts: Vec<String> = columns
        .iter()
        .filter_map(|column| row.get_non_null(column))
        .map(text_of)
        .filter(|text| !text.trim().is_empty())
        .collect();
    if parts.is_empty() {
        Value::Null
    } else {
        Value::String(parts.join(" "))
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" => Some(true),
            "false" | "f" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Extract the numeric part of a geographic code and pad it to `width` digits.
///
/// `"6"` becomes `"006"` for county codes, `"MA05"` becomes `"05"` for
/// congressional districts. The digit run is read as an integer, so leading
/// zeros are normalized; like SQL `LPAD`, a longer run is cut to `width`.
/// Values without a digit run yield `None`.
pub fn extract_geo_code(raw: &str, width: usize) -> Option<String> {
    let captures = GEO_CODE_REGEXP.captures(raw.trim())?;
    let digits = captures.get(1)?.as_str().trim_start_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };

    if digits.len() >= width {
        Some(digits[..width].to_string())
    } else {
        Some(format!("{}{}", "0".repeat(width - digits.len()), digits))
    }
}

/// Parse a PostgreSQL array literal (`{a,"b c",NULL}`) into JSON values.
///
/// Returns `None` when `raw` is not an array literal.
pub fn parse_postgres_array(raw: &str) -> Option<Vec<Value>> {
    let inner = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }

    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        let item = if chars.peek() == Some(&'"') {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next()? {
                    '\\' => text.push(chars.next()?),
                    '"' => break,
                    c => text.push(c),
                }
            }
            Value::String(text)
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                text.push(c);
                chars.next();
            }
            let text = text.trim();
            if text.eq_ignore_ascii_case("null") {
                Value::Null
            } else {
                Value::String(text.to_string())
            }
        };
        items.push(item);

        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return None,
        }
    }
    Some(items)
}
