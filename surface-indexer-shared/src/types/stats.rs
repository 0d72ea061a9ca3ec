//! Rebuild modes and build statistics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::marker::Marker;

/// How the search index is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildMode {
    /// Populate a fresh generation from one snapshot and swap the alias.
    Full,
    /// Apply rows modified after the watermark to the published alias.
    Incremental,
}

impl FromStr for RebuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown rebuild mode '{}'", other)),
        }
    }
}

impl fmt::Display for RebuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Incremental => f.write_str("incremental"),
        }
    }
}

/// Aggregate outcome of one index build run.
///
/// Per-document problems never abort a run; they only show up here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexBuildStats {
    /// Documents committed to the destination.
    pub indexed: u64,
    /// Documents the engine rejected after all individual retries.
    pub failed: u64,
    /// Rows the document mapper could not turn into documents.
    pub skipped: u64,
    /// Documents deleted by the deletion pass of incremental runs.
    pub deleted: u64,
    /// Batches processed.
    pub batches: u64,
    /// Highest modification marker observed across all batches.
    pub max_marker: Option<Marker>,
}

impl IndexBuildStats {
    /// Rows read from the source.
    pub fn processed(&self) -> u64 {
        self.indexed + self.failed + self.skipped
    }

    /// Fold the outcome of one batch into the run totals.
    pub fn absorb(&mut self, batch: &IndexBuildStats) {
        self.indexed += batch.indexed;
        self.failed += batch.failed;
        self.skipped += batch.skipped;
        self.deleted += batch.deleted;
        self.batches += batch.batches;
        self.max_marker = Marker::max_of(self.max_marker.take(), batch.max_marker.clone());
    }
}
