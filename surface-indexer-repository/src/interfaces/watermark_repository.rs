use surface_indexer_shared::Marker;

use crate::errors::WatermarkRepositoryError;

/// Trait for persisting incremental rebuild watermarks.
///
/// A watermark is the highest modification marker a run has fully indexed.
/// Incremental runs read rows strictly after it.
#[async_trait::async_trait]
pub trait WatermarkRepository: Send + Sync {
    async fn get_watermark(&self, id: &str) -> Result<Option<Marker>, WatermarkRepositoryError>;
    async fn save_watermark(&self, id: &str, watermark: &Marker) -> Result<(), WatermarkRepositoryError>;
}
