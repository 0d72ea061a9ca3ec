use async_trait::async_trait;
use surface_indexer_shared::SourceRow;

use crate::errors::SourceError;
use crate::types::SourceQuery;

/// Streams rows of a source query.
///
/// A reader opens one cursor per run. All batches of a cursor are read from the
/// same consistent snapshot, so rows committed while a run is in progress are
/// neither half-visible nor duplicated.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn open(&self, query: &SourceQuery) -> Result<Box<dyn RowCursor>, SourceError>;
}

/// A server-side cursor over a source query.
#[async_trait]
pub trait RowCursor: Send {
    /// Fetch up to `limit` rows. An empty batch means the cursor is exhausted.
    async fn next_batch(&mut self, limit: usize) -> Result<Vec<SourceRow>, SourceError>;

    /// Release the cursor and its snapshot.
    async fn close(self: Box<Self>) -> Result<(), SourceError>;
}
