//! # Surface Indexer
//!
//! Rebuilds denormalized query surfaces from the transactional database and
//! publishes them without downtime: PostgreSQL materialized views, swapped in
//! by an atomic rename, and search index generations, swapped in by an atomic
//! alias update.
//!
//! ## Architecture
//!
//! 1. **Spec loader**: Parses and validates view specs and the document template
//! 2. **Compiler**: Turns a view spec into its DDL plan
//! 3. **Views**: Builds, validates and swaps view generations
//! 4. **Processor**: Maps source rows to search documents
//! 5. **Loader**: Writes documents with bulk requests and retries
//! 6. **Pipeline**: Streams the source query through the mapper and loader
//! 7. **Publisher**: Allocates, publishes and retires index generations
//! 8. **Orchestrator**: Runs every rebuild of one invocation concurrently
//!
//! ## Modules
//!
//! - [`config`]: Settings and dependency initialization
//! - [`errors`]: Error types for the rebuilds

pub mod compiler;
pub mod config;
pub mod errors;
pub mod loader;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod publisher;
pub mod spec_loader;
pub mod views;

pub use config::{Dependencies, Settings};
pub use errors::RebuildError;
pub use orchestrator::{Orchestrator, RebuildReport};

use thiserror::Error;

/// Errors that can occur during indexer initialization or execution.
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Rebuild error.
    #[error("Rebuild error: {0}")]
    RebuildError(#[from] RebuildError),

    /// At least one rebuild did not publish.
    #[error("Rebuild failed: {0}")]
    RunFailed(String),
}

impl IndexingError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
