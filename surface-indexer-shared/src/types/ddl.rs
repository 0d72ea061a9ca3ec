//! Executable DDL plans produced by the view compiler.

use serde::{Deserialize, Serialize};

/// What a DDL statement does, used for logging and for the swap state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    DropStaging,
    DropDiscard,
    CreateView,
    CreateIdentityIndex,
    CreateIndex,
    Grant,
    Analyze,
    Rename,
    Refresh,
}

/// One DDL statement with a human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlStatement {
    pub kind: StatementKind,
    pub label: String,
    pub sql: String,
}

impl DdlStatement {
    pub fn new(kind: StatementKind, label: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            sql: sql.into(),
        }
    }

    /// Whether the statement creates an index.
    pub fn is_index(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::CreateIdentityIndex | StatementKind::CreateIndex
        )
    }
}

/// Ordered build plan for one view generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlPlan {
    /// Public relation name.
    pub view: String,
    /// Name the generation is built under.
    pub staging: String,
    /// Name the previous generation is demoted to.
    pub discard: String,
    /// The compiled query, identity column included.
    pub query: String,
    /// Statements in execution order.
    pub statements: Vec<DdlStatement>,
    /// Final names of the indexes the plan creates (without staging suffix).
    pub index_names: Vec<String>,
}

impl DdlPlan {
    /// Statements that populate the generation (drop, create).
    pub fn build_statements(&self) -> impl Iterator<Item = &DdlStatement> {
        self.statements
            .iter()
            .filter(|s| matches!(s.kind, StatementKind::DropStaging | StatementKind::CreateView))
    }

    /// Statements that finish the generation after it is populated.
    pub fn index_statements(&self) -> impl Iterator<Item = &DdlStatement> {
        self.statements
            .iter()
            .filter(|s| !matches!(s.kind, StatementKind::DropStaging | StatementKind::CreateView))
    }
}
