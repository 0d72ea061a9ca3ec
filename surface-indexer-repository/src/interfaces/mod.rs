//! Boundary traits.
//!
//! Pipelines and coordinators depend only on these traits so that the
//! PostgreSQL and OpenSearch implementations can be swapped for in-memory
//! doubles in tests.

mod search_index_provider;
mod source_reader;
mod view_store;
mod watermark_repository;

pub use search_index_provider::SearchIndexProvider;
pub use source_reader::{RowCursor, SourceReader};
pub use view_store::ViewStore;
pub use watermark_repository::WatermarkRepository;
