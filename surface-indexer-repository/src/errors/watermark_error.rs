use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatermarkRepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored watermark '{0}' is not a valid marker")]
    InvalidWatermark(String),
}
