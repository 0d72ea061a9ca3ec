//! Cursor-based source reading.
//!
//! Rows are streamed through a server-side cursor inside a `REPEATABLE READ`,
//! read-only transaction: every batch of a run sees the same snapshot and the
//! full result set is never materialized client side.
//!
//! The transaction runs in UTC: markers are compared as `timestamptz` literals,
//! and `timestamp` columns are converted with the session time zone.

use async_trait::async_trait;
use sqlx::{Executor, PgPool, Postgres, Transaction};
use surface_indexer_shared::SourceRow;
use tracing::debug;

use crate::errors::SourceError;
use crate::interfaces::{RowCursor, SourceReader};
use crate::types::SourceQuery;

const CURSOR_NAME: &str = "surface_source_rows";

pub struct PostgresSourceReader {
    pool: PgPool,
}

impl PostgresSourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceReader for PostgresSourceReader {
    async fn open(&self, query: &SourceQuery) -> Result<Box<dyn RowCursor>, SourceError> {
        let mut tx = self.pool.begin().await?;
        (&mut *tx).execute(sqlx::raw_sql("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY"))
            .await?;
        (&mut *tx).execute(sqlx::raw_sql("SET LOCAL TIME ZONE 'UTC'"))
            .await?;

        // DECLARE takes no bind parameters; markers are rendered as literals.
        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR_NAME, query.render());
        (&mut *tx).execute(sqlx::raw_sql(&declare)).await?;

        debug!(marker_column = ?query.marker_column, after = ?query.after, "Opened source cursor");
        Ok(Box::new(PostgresRowCursor {
            tx: Some(tx),
            exhausted: false,
        }))
    }
}

struct PostgresRowCursor {
    tx: Option<Transaction<'static, Postgres>>,
    exhausted: bool,
}

#[async_trait]
impl RowCursor for PostgresRowCursor {
    async fn next_batch(&mut self, limit: usize) -> Result<Vec<SourceRow>, SourceError> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let tx = self.tx.as_mut().ok_or(SourceError::Closed)?;

        let fetch = format!("FETCH FORWARD {} FROM {}", limit.max(1), CURSOR_NAME);
        let raw_rows: Vec<String> = sqlx::query_scalar(&fetch).fetch_all(&mut **tx).await?;
        if raw_rows.len() < limit {
            self.exhausted = true;
        }

        raw_rows
            .iter()
            .map(|raw| SourceRow::from_json(raw).map_err(|e| SourceError::MalformedRow(e.to_string())))
            .collect()
    }

    async fn close(mut self: Box<Self>) -> Result<(), SourceError> {
        if let Some(mut tx) = self.tx.take() {
            (&mut *tx).execute(sqlx::raw_sql(&format!("CLOSE {}", CURSOR_NAME)))
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}
