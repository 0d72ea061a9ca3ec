use async_trait::async_trait;
use surface_indexer_shared::{DdlStatement, RowCountGuard};

use crate::errors::ViewStoreError;

/// Executes view DDL and answers catalog questions about view generations.
#[async_trait]
pub trait ViewStore: Send + Sync {
    /// Run one statement on its own, under the configured statement timeout.
    async fn execute(&self, statement: &DdlStatement) -> Result<(), ViewStoreError>;

    /// Run statements in a single transaction; either all take effect or none do.
    async fn execute_atomic(
        &self,
        view: &str,
        statements: &[DdlStatement],
    ) -> Result<(), ViewStoreError>;

    /// Run a statement that rewrites `view` in place, counting its rows before
    /// and after in the same transaction. The transaction is rolled back with
    /// [`ViewStoreError::Rejected`] when `guard` refuses the new count.
    ///
    /// Returns the row counts before and after.
    async fn execute_guarded(
        &self,
        view: &str,
        statement: &DdlStatement,
        guard: &RowCountGuard,
    ) -> Result<(u64, u64), ViewStoreError>;

    /// Whether a relation with this name exists.
    async fn relation_exists(&self, name: &str) -> Result<bool, ViewStoreError>;

    /// Row count of a relation, `None` when it does not exist.
    async fn count_rows(&self, name: &str) -> Result<Option<u64>, ViewStoreError>;

    /// Names of the indexes defined on a relation.
    async fn index_names(&self, relation: &str) -> Result<Vec<String>, ViewStoreError>;

    /// Drop a materialized view and its indexes if it exists.
    async fn drop_view(&self, name: &str) -> Result<(), ViewStoreError>;
}
