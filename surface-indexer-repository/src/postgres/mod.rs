//! PostgreSQL implementations of the source, view and watermark boundaries.

mod source_reader;
mod view_store;
mod watermark_repository;

pub use source_reader::PostgresSourceReader;
pub use view_store::PostgresViewStore;
pub use watermark_repository::PostgresWatermarkRepository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Open a connection pool.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
}

/// Apply the crate's migrations (the watermark table).
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("src/postgres/migrations").run(pool).await
}
