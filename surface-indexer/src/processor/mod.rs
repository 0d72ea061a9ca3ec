//! Processor module for the surface indexer.
//!
//! Transforms source rows into search documents.

mod document_mapper;

pub use document_mapper::{
    extract_geo_code, map_row, parse_postgres_array, DocumentMapper, MappedBatch,
};
