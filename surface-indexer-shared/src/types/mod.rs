//! Runtime data types flowing through the rebuild pipelines.

mod ddl;
mod document;
mod guard;
mod marker;
mod stats;

pub use ddl::{DdlPlan, DdlStatement, StatementKind};
pub use document::{Document, SourceRow};
pub use guard::RowCountGuard;
pub use marker::Marker;
pub use stats::{IndexBuildStats, RebuildMode};
