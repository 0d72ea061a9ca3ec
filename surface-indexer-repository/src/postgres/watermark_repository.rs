//! PostgreSQL implementation of the watermark repository.
//!
//! Stores watermarks in a `rebuild_watermarks` table so incremental runs resume
//! where the last completed run stopped.

use async_trait::async_trait;
use surface_indexer_shared::Marker;

use crate::errors::WatermarkRepositoryError;
use crate::WatermarkRepository;

/// PostgreSQL-backed watermark repository.
///
/// Persists one watermark per pipeline id with an upsert, in the marker's text form.
pub struct PostgresWatermarkRepository {
    /// PostgreSQL connection pool
    pool: sqlx::PgPool,
}

impl PostgresWatermarkRepository {
    /// Creates a new PostgreSQL watermark repository instance.
    ///
    /// # Arguments
    ///
    /// * `pool` - Configured PostgreSQL connection pool with required schema (rebuild_watermarks table)
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkRepository for PostgresWatermarkRepository {
    async fn get_watermark(&self, id: &str) -> Result<Option<Marker>, WatermarkRepositoryError> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT watermark FROM rebuild_watermarks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        stored
            .map(|raw| Marker::parse(&raw).ok_or(WatermarkRepositoryError::InvalidWatermark(raw)))
            .transpose()
    }

    async fn save_watermark(
        &self,
        id: &str,
        watermark: &Marker,
    ) -> Result<(), WatermarkRepositoryError> {
        sqlx::query(
            "INSERT INTO rebuild_watermarks (id, watermark, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (id) DO UPDATE SET watermark = $2, updated_at = now()",
        )
        .bind(id)
        .bind(watermark.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
