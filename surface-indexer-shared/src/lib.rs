//! # Surface Indexer Shared
//!
//! Types shared by the surface indexer crates: the typed view and document
//! specifications, source rows and search documents, modification markers,
//! the deterministic row identity and the fixed-point scaled-float codec.

pub mod identity;
pub mod scaled;
pub mod spec;
pub mod types;

pub use identity::{RowIdentity, IDENTITY_COLUMN};
pub use scaled::{ScaledFloat, ScaledFloatError};
pub use spec::{
    DocumentTemplate, FieldMapping, FieldType, FilteredAlias, IndexColumn, IndexMethod,
    IndexSettings, IndexSort, IndexSpec, NullsOrder, SortDirection, ViewSpec,
};
pub use types::{
    DdlPlan, DdlStatement, Document, IndexBuildStats, Marker, RebuildMode, RowCountGuard,
    SourceRow, StatementKind,
};
