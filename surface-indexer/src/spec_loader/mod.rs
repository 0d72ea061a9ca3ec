//! Spec loader.
//!
//! Parses view specifications and the document template from JSON and validates
//! them once into the immutable typed objects every other component uses.
//! Shape problems (missing fields, wrong JSON types) are
//! [`RebuildError::SpecParse`]; inconsistent content is
//! [`RebuildError::SpecValidation`].

mod raw;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use surface_indexer_repository::opensearch::IndexConfig;
use surface_indexer_shared::{
    DocumentTemplate, FieldMapping, FieldType, FilteredAlias, IndexColumn, IndexMethod,
    IndexSettings, IndexSort, IndexSpec, NullsOrder, SortDirection, ViewSpec, IDENTITY_COLUMN,
};
use tracing::{debug, info, warn};

use crate::compiler::{self, query, DISCARD_SUFFIX, STAGING_SUFFIX};
use crate::errors::RebuildError;
use raw::{RawDocumentTemplate, RawFieldMapping, RawIndexSpec, RawViewSpec};

lazy_static! {
    static ref IDENTIFIER_REGEXP: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
}

/// PostgreSQL truncates identifiers longer than this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Parse and validate a view specification.
pub fn parse_view_spec(raw: &str) -> Result<ViewSpec, RebuildError> {
    let raw: RawViewSpec = serde_json::from_str(raw)
        .map_err(|e| RebuildError::spec_parse(format!("view spec: {}", e)))?;
    validate_view_spec(raw)
}

/// Load one view specification file.
pub fn load_view_spec(path: &Path) -> Result<ViewSpec, RebuildError> {
    let contents = read_file(path)?;
    parse_view_spec(&contents).map_err(|e| with_path(e, path))
}

/// Load every `*.json` view specification of a directory, in file-name order.
///
/// Two files declaring the same `final_name` are rejected.
pub fn load_view_specs_dir(dir: &Path) -> Result<Vec<ViewSpec>, RebuildError> {
    let entries = fs::read_dir(dir).map_err(|e| {
        RebuildError::spec_parse(format!("cannot read '{}': {}", dir.display(), e))
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            RebuildError::spec_parse(format!("cannot read '{}': {}", dir.display(), e))
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut names = HashSet::new();
    let mut specs = Vec::with_capacity(paths.len());
    for path in paths {
        let spec = load_view_spec(&path)?;
        if !names.insert(spec.name.clone()) {
            return Err(RebuildError::spec_validation(format!(
                "view '{}' is declared twice (again in '{}')",
                spec.name,
                path.display()
            )));
        }
        specs.push(spec);
    }

    info!(dir = %dir.display(), views = specs.len(), "Loaded view specifications");
    Ok(specs)
}

/// Parse and validate a document template.
pub fn parse_document_template(raw: &str) -> Result<DocumentTemplate, RebuildError> {
    let raw: RawDocumentTemplate = serde_json::from_str(raw)
        .map_err(|e| RebuildError::spec_parse(format!("document template: {}", e)))?;
    validate_template(raw)
}

/// Load the document template file.
pub fn load_document_template(path: &Path) -> Result<DocumentTemplate, RebuildError> {
    let contents = read_file(path)?;
    let template = parse_document_template(&contents).map_err(|e| with_path(e, path))?;
    info!(
        path = %path.display(),
        fields = template.fields.len(),
        "Loaded document template"
    );
    Ok(template)
}

/// Check that the template's `index_patterns` cover the alias's generations.
///
/// Generations are created as `<alias>_v<N>`; a template whose patterns match
/// none of them would never apply to the indices this service builds.
pub fn check_index_patterns(
    template: &DocumentTemplate,
    index_config: &IndexConfig,
) -> Result<(), RebuildError> {
    let samples: Vec<String> = [1, 2, 10, 123]
        .iter()
        .map(|version| index_config.generation_name(*version))
        .collect();
    let covered = template.index_patterns.iter().any(|pattern| {
        samples
            .iter()
            .all(|name| wildcard_match(pattern.as_bytes(), name.as_bytes()))
    });
    if !covered {
        return Err(RebuildError::spec_validation(format!(
            "index_patterns {:?} do not match generations of alias '{}' (e.g. '{}')",
            template.index_patterns, index_config.alias, samples[0]
        )));
    }
    Ok(())
}

/// Index-pattern match where `*` stands for any run of characters.
fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => (0..=name.len()).any(|skip| wildcard_match(rest, &name[skip..])),
        Some((c, rest)) => name.first() == Some(c) && wildcard_match(rest, &name[1..]),
    }
}

fn read_file(path: &Path) -> Result<String, RebuildError> {
    fs::read_to_string(path)
        .map_err(|e| RebuildError::spec_parse(format!("cannot read '{}': {}", path.display(), e)))
}

fn with_path(err: RebuildError, path: &Path) -> RebuildError {
    match err {
        RebuildError::SpecParse(msg) => {
            RebuildError::SpecParse(format!("{}: {}", path.display(), msg))
        }
        RebuildError::SpecValidation(msg) => {
            RebuildError::SpecValidation(format!("{}: {}", path.display(), msg))
        }
        other => other,
    }
}

/// Check that `name` can be used unquoted and still fits once `suffix` is appended.
fn check_identifier(kind: &str, name: &str, suffix_len: usize) -> Result<(), RebuildError> {
    if !IDENTIFIER_REGEXP.is_match(name) {
        return Err(RebuildError::spec_validation(format!(
            "{} '{}' is not a lower-case SQL identifier",
            kind, name
        )));
    }
    if name.len() + suffix_len > MAX_IDENTIFIER_LEN {
        return Err(RebuildError::spec_validation(format!(
            "{} '{}' is too long: at most {} bytes are allowed",
            kind,
            name,
            MAX_IDENTIFIER_LEN - suffix_len
        )));
    }
    Ok(())
}

fn validate_view_spec(raw: RawViewSpec) -> Result<ViewSpec, RebuildError> {
    let name = raw.final_name;
    check_identifier("view name", &name, STAGING_SUFFIX.len().max(DISCARD_SUFFIX.len()))?;

    let select_sql = raw
        .matview_sql
        .iter()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    if select_sql.trim().is_empty() {
        return Err(RebuildError::spec_validation(format!(
            "view '{}' has an empty matview_sql",
            name
        )));
    }

    let parsed = query::parse_query(&select_sql)
        .map_err(|e| RebuildError::spec_validation(format!("view '{}': {}", name, e)))?;
    let mut projection = query::projection(&parsed);

    let identity_source = match raw.identity_source {
        Some(source) if source.trim().is_empty() => {
            return Err(RebuildError::spec_validation(format!(
                "view '{}' has an empty identity_source",
                name
            )));
        }
        Some(source) => {
            if raw.group_by.is_empty() {
                if let Some(aggregate) = query::ungrouped_aggregate(&parsed) {
                    return Err(RebuildError::spec_validation(format!(
                        "view '{}' aggregates with {}() but has no GROUP BY or group_by; \
                         its identity cannot be computed",
                        name, aggregate
                    )));
                }
            }
            check_identifier(
                "identity index",
                &compiler::identity_index_name(&name),
                STAGING_SUFFIX.len().max(DISCARD_SUFFIX.len()),
            )?;
            if projection.contains(IDENTITY_COLUMN) {
                return Err(RebuildError::spec_validation(format!(
                    "view '{}' already projects a '{}' column",
                    name, IDENTITY_COLUMN
                )));
            }
            projection.columns.push(IDENTITY_COLUMN.to_string());
            Some(source)
        }
        None => None,
    };

    if projection.has_wildcard {
        warn!(view = %name, "Projection contains '*'; index columns are not validated");
    }

    for column in &raw.group_by {
        if column.trim().is_empty() {
            return Err(RebuildError::spec_validation(format!(
                "view '{}' has an empty group_by entry",
                name
            )));
        }
    }

    let mut index_names = HashSet::new();
    let mut index_specs = Vec::with_capacity(raw.indexes.len());
    for index in raw.indexes {
        let spec = validate_index(&name, index, &projection)?;
        if !index_names.insert(spec.name.clone()) {
            return Err(RebuildError::spec_validation(format!(
                "view '{}' declares index '{}' twice",
                name, spec.name
            )));
        }
        index_specs.push(spec);
    }

    for role in &raw.grant_select {
        if !IDENTIFIER_REGEXP.is_match(role) {
            return Err(RebuildError::spec_validation(format!(
                "view '{}' grants to invalid role '{}'",
                name, role
            )));
        }
    }

    debug!(
        view = %name,
        indexes = index_specs.len(),
        identity = identity_source.is_some(),
        "Validated view specification"
    );

    let spec = ViewSpec {
        name,
        refresh: raw.refresh,
        select_sql,
        group_by_columns: raw.group_by,
        identity_source,
        index_specs,
        grant_select: raw.grant_select,
    };
    // Grouping and identity rewrites only apply to plain SELECTs.
    compiler::compile_query(&spec)?;
    Ok(spec)
}

fn validate_index(
    view: &str,
    raw: RawIndexSpec,
    projection: &query::Projection,
) -> Result<IndexSpec, RebuildError> {
    check_identifier(
        "index name",
        &raw.name,
        STAGING_SUFFIX.len().max(DISCARD_SUFFIX.len()),
    )?;
    if raw.columns.is_empty() {
        return Err(RebuildError::spec_validation(format!(
            "index '{}' on '{}' has no columns",
            raw.name, view
        )));
    }

    let method = match raw.method.as_deref() {
        None => IndexMethod::default(),
        Some(m) => IndexMethod::parse(m).ok_or_else(|| {
            RebuildError::spec_validation(format!(
                "index '{}' uses unsupported method '{}'",
                raw.name, m
            ))
        })?,
    };
    if raw.unique && !method.supports_unique() {
        return Err(RebuildError::spec_validation(format!(
            "index '{}': method {} cannot be unique",
            raw.name, method
        )));
    }

    let mut columns = Vec::with_capacity(raw.columns.len());
    for column in raw.columns {
        let name = column.name.trim().to_string();
        if name.is_empty() {
            return Err(RebuildError::spec_validation(format!(
                "index '{}' has an empty column",
                raw.name
            )));
        }
        // Expressions are passed through; only plain column references are checked.
        if IDENTIFIER_REGEXP.is_match(&name)
            && !projection.has_wildcard
            && !projection.contains(&name)
        {
            return Err(RebuildError::spec_validation(format!(
                "index '{}' references column '{}' which view '{}' does not project",
                raw.name, name, view
            )));
        }

        let order = match column.order.as_deref() {
            None => None,
            Some(o) => Some(SortDirection::parse(o).ok_or_else(|| {
                RebuildError::spec_validation(format!(
                    "index '{}': invalid order '{}' on column '{}'",
                    raw.name, o, name
                ))
            })?),
        };
        let nulls = match column.nulls.as_deref().map(str::to_ascii_lowercase) {
            None => None,
            Some(n) if n == "first" => Some(NullsOrder::First),
            Some(n) if n == "last" => Some(NullsOrder::Last),
            Some(n) => {
                return Err(RebuildError::spec_validation(format!(
                    "index '{}': invalid nulls placement '{}' on column '{}'",
                    raw.name, n, name
                )));
            }
        };
        if (order.is_some() || nulls.is_some()) && !method.supports_ordering() {
            return Err(RebuildError::spec_validation(format!(
                "index '{}': method {} does not support column ordering",
                raw.name, method
            )));
        }

        columns.push(IndexColumn {
            name,
            order,
            nulls,
            opclass: column.opclass.filter(|o| !o.trim().is_empty()),
        });
    }

    Ok(IndexSpec {
        name: raw.name,
        columns,
        unique: raw.unique,
        partial_predicate: raw.where_clause.filter(|w| !w.trim().is_empty()),
        method,
    })
}

fn validate_template(raw: RawDocumentTemplate) -> Result<DocumentTemplate, RebuildError> {
    if raw.index_patterns.is_empty() {
        return Err(RebuildError::spec_validation(
            "document template has no index_patterns",
        ));
    }
    if raw.id_field.trim().is_empty() {
        return Err(RebuildError::spec_validation(
            "document template has an empty id_field",
        ));
    }
    if raw.mappings.is_empty() {
        return Err(RebuildError::spec_validation(
            "document template maps no fields",
        ));
    }

    let fields = parse_fields(&raw.mappings, "")?;

    let sort = match raw.sort {
        None => None,
        Some(sort) => {
            if sort.fields.len() != sort.order.len() {
                return Err(RebuildError::spec_validation(format!(
                    "sort declares {} fields but {} orders",
                    sort.fields.len(),
                    sort.order.len()
                )));
            }
            for field in &sort.fields {
                if !fields.iter().any(|(name, _)| name == field) {
                    return Err(RebuildError::spec_validation(format!(
                        "sort field '{}' is not mapped",
                        field
                    )));
                }
            }
            let order = sort
                .order
                .iter()
                .map(|o| {
                    SortDirection::parse(o).ok_or_else(|| {
                        RebuildError::spec_validation(format!("invalid sort order '{}'", o))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(IndexSort {
                fields: sort.fields,
                order,
            })
        }
    };

    let mut aliases = Vec::with_capacity(raw.aliases.len());
    for alias in raw.aliases {
        if alias.suffix.trim().is_empty() {
            return Err(RebuildError::spec_validation("alias with an empty suffix"));
        }
        if !fields.iter().any(|(name, _)| *name == alias.field) {
            return Err(RebuildError::spec_validation(format!(
                "alias '{}' filters on unmapped field '{}'",
                alias.suffix, alias.field
            )));
        }
        aliases.push(FilteredAlias {
            suffix: alias.suffix,
            field: alias.field,
            values: alias.values,
        });
    }

    Ok(DocumentTemplate {
        index_patterns: raw.index_patterns,
        settings: IndexSettings {
            refresh_interval: raw.settings.refresh_interval,
            shards: raw.settings.shards,
            replicas: raw.settings.replicas,
            analysis: raw.settings.analysis,
        },
        sort,
        fields,
        id_field: raw.id_field,
        marker_field: raw.marker_field.filter(|m| !m.trim().is_empty()),
        aliases,
    })
}

/// Parse an ordered mapping section; `prefix` names the parent field in errors.
fn parse_fields(
    mappings: &Map<String, Value>,
    prefix: &str,
) -> Result<Vec<(String, FieldMapping)>, RebuildError> {
    let mut fields = Vec::with_capacity(mappings.len());
    for (name, value) in mappings {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        let raw: RawFieldMapping = serde_json::from_value(value.clone())
            .map_err(|e| RebuildError::spec_parse(format!("mapping '{}': {}", path, e)))?;
        fields.push((name.clone(), parse_field(&path, raw)?));
    }
    Ok(fields)
}

fn parse_field(path: &str, raw: RawFieldMapping) -> Result<FieldMapping, RebuildError> {
    let field_type = FieldType::parse(&raw.field_type).ok_or_else(|| {
        RebuildError::spec_validation(format!(
            "field '{}' has unsupported type '{}'",
            path, raw.field_type
        ))
    })?;

    let scaling_factor = match (field_type, raw.scaling_factor) {
        (FieldType::ScaledFloat, Some(factor)) => Some(positive_integer(&factor).ok_or_else(
            || {
                RebuildError::spec_validation(format!(
                    "field '{}' has invalid scaling_factor {}",
                    path, factor
                ))
            },
        )?),
        (FieldType::ScaledFloat, None) => {
            return Err(RebuildError::spec_validation(format!(
                "scaled_float field '{}' has no scaling_factor",
                path
            )));
        }
        (_, Some(_)) => {
            return Err(RebuildError::spec_validation(format!(
                "field '{}' declares scaling_factor but is not a scaled_float",
                path
            )));
        }
        (_, None) => None,
    };

    if !field_type.is_string() {
        if raw.zero_pad.is_some() {
            return Err(RebuildError::spec_validation(format!(
                "zero_pad on non-string field '{}'",
                path
            )));
        }
        if !raw.concat.is_empty() {
            return Err(RebuildError::spec_validation(format!(
                "concat on non-string field '{}'",
                path
            )));
        }
    }
    if raw.zero_pad == Some(0) {
        return Err(RebuildError::spec_validation(format!(
            "field '{}' has a zero_pad width of 0",
            path
        )));
    }
    if raw.properties.is_some() && !field_type.is_container() {
        return Err(RebuildError::spec_validation(format!(
            "field '{}' declares properties but is {}",
            path, field_type
        )));
    }

    let sub_fields = match raw.fields {
        Some(ref fields) => parse_fields(fields, path)?,
        None => Vec::new(),
    };
    let properties = match raw.properties {
        Some(ref properties) => parse_fields(properties, path)?,
        None => Vec::new(),
    };

    Ok(FieldMapping {
        field_type,
        format: raw.format,
        scaling_factor,
        analyzer: raw.analyzer,
        sub_fields,
        properties,
        source: raw.source.filter(|s| !s.trim().is_empty()),
        zero_pad: raw.zero_pad,
        concat: raw.concat,
    })
}

/// A JSON number that is a positive integer, written either as `100` or `100.0`.
fn positive_integer(number: &serde_json::Number) -> Option<u64> {
    if let Some(n) = number.as_u64() {
        return (n > 0).then_some(n);
    }
    number
        .as_f64()
        .filter(|f| *f >= 1.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
        .map(|f| f as u64)
}
