//! PostgreSQL view store.
//!
//! Every statement runs in its own transaction with `SET LOCAL statement_timeout`
//! so a runaway build is cancelled by the server instead of holding locks
//! indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Executor, PgPool, Postgres, Transaction};
use surface_indexer_shared::{DdlStatement, RowCountGuard};
use tracing::debug;

use crate::errors::ViewStoreError;
use crate::interfaces::ViewStore;

pub struct PostgresViewStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PostgresViewStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let timeout = format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        );
        (&mut *tx).execute(sqlx::raw_sql(&timeout)).await?;
        Ok(tx)
    }
}

#[async_trait]
impl ViewStore for PostgresViewStore {
    async fn execute(&self, statement: &DdlStatement) -> Result<(), ViewStoreError> {
        debug!(label = %statement.label, "Executing statement");
        let mut tx = self
            .begin()
            .await
            .map_err(|e| ViewStoreError::statement(&statement.label, e))?;
        (&mut *tx).execute(sqlx::raw_sql(&statement.sql))
            .await
            .map_err(|e| ViewStoreError::statement(&statement.label, e))?;
        tx.commit()
            .await
            .map_err(|e| ViewStoreError::statement(&statement.label, e))?;
        Ok(())
    }

    async fn execute_atomic(
        &self,
        view: &str,
        statements: &[DdlStatement],
    ) -> Result<(), ViewStoreError> {
        let swap_error = |source| ViewStoreError::Swap {
            view: view.to_string(),
            source,
        };

        // Dropping the transaction on error rolls every statement back.
        let mut tx = self.begin().await.map_err(swap_error)?;
        for statement in statements {
            debug!(view = %view, label = %statement.label, "Executing swap statement");
            (&mut *tx).execute(sqlx::raw_sql(&statement.sql))
                .await
                .map_err(swap_error)?;
        }
        tx.commit().await.map_err(swap_error)?;
        Ok(())
    }

    async fn execute_guarded(
        &self,
        view: &str,
        statement: &DdlStatement,
        guard: &RowCountGuard,
    ) -> Result<(u64, u64), ViewStoreError> {
        let failed = |e| ViewStoreError::statement(&statement.label, e);
        let count = format!("SELECT COUNT(*) FROM {}", view);

        let mut tx = self.begin().await.map_err(failed)?;
        let before: i64 = sqlx::query_scalar(&count)
            .fetch_one(&mut *tx)
            .await
            .map_err(failed)?;
        (&mut *tx).execute(sqlx::raw_sql(&statement.sql))
            .await
            .map_err(failed)?;
        let after: i64 = sqlx::query_scalar(&count)
            .fetch_one(&mut *tx)
            .await
            .map_err(failed)?;

        let (before, after) = (before.max(0) as u64, after.max(0) as u64);
        if let Err(reason) = guard.check(after, Some(before)) {
            tx.rollback().await.map_err(failed)?;
            return Err(ViewStoreError::Rejected {
                view: view.to_string(),
                reason,
            });
        }
        tx.commit().await.map_err(failed)?;
        debug!(view = %view, before = before, after = after, "Rewrote view in place");
        Ok((before, after))
    }

    async fn relation_exists(&self, name: &str) -> Result<bool, ViewStoreError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn count_rows(&self, name: &str) -> Result<Option<u64>, ViewStoreError> {
        if !self.relation_exists(name).await? {
            return Ok(None);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", name))
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(count.max(0) as u64))
    }

    async fn index_names(&self, relation: &str) -> Result<Vec<String>, ViewStoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT indexname::text FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1 \
             ORDER BY indexname",
        )
        .bind(relation)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn drop_view(&self, name: &str) -> Result<(), ViewStoreError> {
        let statement = format!("DROP MATERIALIZED VIEW IF EXISTS {} CASCADE", name);
        (&self.pool).execute(sqlx::raw_sql(&statement))
            .await
            .map_err(|e| ViewStoreError::statement(format!("drop {}", name), e))?;
        Ok(())
    }
}
