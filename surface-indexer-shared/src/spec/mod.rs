//! Declarative specifications, in their validated, typed form.

mod document_template;
mod view_spec;

pub use document_template::{
    DocumentTemplate, FieldMapping, FieldType, FilteredAlias, IndexSettings, IndexSort,
};
pub use view_spec::{IndexColumn, IndexMethod, IndexSpec, NullsOrder, SortDirection, ViewSpec};
