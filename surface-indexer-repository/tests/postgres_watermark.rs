//! Integration tests for the PostgreSQL watermark repository.
//!
//! These tests require a real PostgreSQL database and use SQLx test macros
//! to ensure proper test isolation and cleanup.
//!
//! Run with: `DATABASE_URL=... cargo test --test postgres_watermark -- --ignored`

use chrono::{TimeZone, Utc};
use surface_indexer_repository::{PostgresWatermarkRepository, WatermarkRepository};
use surface_indexer_shared::Marker;

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_save_and_get_watermark(pool: sqlx::PgPool) {
    let repository = PostgresWatermarkRepository::new(pool.clone());
    let marker = Marker::Timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap());

    repository.save_watermark("transactions", &marker).await.unwrap();

    let retrieved = repository.get_watermark("transactions").await.unwrap();
    assert_eq!(retrieved, Some(marker));
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_get_missing_watermark(pool: sqlx::PgPool) {
    let repository = PostgresWatermarkRepository::new(pool);
    assert_eq!(repository.get_watermark("nonexistent").await.unwrap(), None);
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_update_existing_watermark(pool: sqlx::PgPool) {
    let repository = PostgresWatermarkRepository::new(pool.clone());

    repository
        .save_watermark("transactions", &Marker::Integer(100))
        .await
        .unwrap();
    repository
        .save_watermark("transactions", &Marker::Integer(250))
        .await
        .unwrap();

    assert_eq!(
        repository.get_watermark("transactions").await.unwrap(),
        Some(Marker::Integer(250))
    );

    // Verify only one record exists
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM rebuild_watermarks WHERE id = $1")
            .bind("transactions")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_corrupt_watermark_is_reported(pool: sqlx::PgPool) {
    sqlx::query("INSERT INTO rebuild_watermarks (id, watermark) VALUES ($1, $2)")
        .bind("broken")
        .bind("not-a-marker")
        .execute(&pool)
        .await
        .unwrap();

    let repository = PostgresWatermarkRepository::new(pool);
    assert!(repository.get_watermark("broken").await.is_err());
}
