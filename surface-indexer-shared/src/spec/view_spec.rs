//! Typed materialized view specification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A validated materialized view specification.
///
/// Built once by the spec loader; every other component treats it as immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSpec {
    /// Public relation name readers query.
    pub name: String,
    /// Whether the view takes part in concurrent refreshes of incremental runs.
    pub refresh: bool,
    /// The query producing the view rows (the `matview_sql` lines joined).
    pub select_sql: String,
    /// Grouping columns the compiled query must group by.
    pub group_by_columns: Vec<String>,
    /// SQL expression naming the source row identifier hashed into the row identity.
    pub identity_source: Option<String>,
    /// Indexes created on every generation.
    pub index_specs: Vec<IndexSpec>,
    /// Roles granted `SELECT` on each generation.
    pub grant_select: Vec<String>,
}

impl ViewSpec {
    /// Whether the compiled view carries the row identity column.
    pub fn has_identity(&self) -> bool {
        self.identity_source.is_some()
    }
}

/// One index to create on a view generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub partial_predicate: Option<String>,
    pub method: IndexMethod,
}

/// One column (or expression) of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    pub order: Option<SortDirection>,
    pub nulls: Option<NullsOrder>,
    pub opclass: Option<String>,
}

impl IndexColumn {
    /// A plain column with no ordering or operator class.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: None,
            nulls: None,
            opclass: None,
        }
    }
}

/// PostgreSQL index access method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMethod {
    #[default]
    Btree,
    Gin,
    Gist,
    Hash,
    Brin,
}

impl IndexMethod {
    /// Parse a method name as written in a view specification.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "btree" => Some(Self::Btree),
            "gin" => Some(Self::Gin),
            "gist" => Some(Self::Gist),
            "hash" => Some(Self::Hash),
            "brin" => Some(Self::Brin),
            _ => None,
        }
    }

    /// Whether the access method supports column ordering (`ASC`/`DESC`).
    pub fn supports_ordering(&self) -> bool {
        matches!(self, Self::Btree)
    }

    /// Whether the access method can enforce uniqueness.
    pub fn supports_unique(&self) -> bool {
        matches!(self, Self::Btree)
    }
}

impl fmt::Display for IndexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Btree => "BTREE",
            Self::Gin => "GIN",
            Self::Gist => "GIST",
            Self::Hash => "HASH",
            Self::Brin => "BRIN",
        };
        f.write_str(name)
    }
}

/// Sort direction for index columns and index sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// `NULLS FIRST` / `NULLS LAST` placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}
