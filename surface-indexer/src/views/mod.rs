//! View swap coordinator.
//!
//! Builds a new generation of a materialized view under its staging name,
//! validates it, and publishes it with one atomic rename transaction. The
//! published generation keeps serving readers until that transaction commits.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use surface_indexer_repository::{ViewStore, ViewStoreError};
use surface_indexer_shared::{DdlPlan, DdlStatement, RowCountGuard, ViewSpec};
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, info, instrument, warn};

use crate::compiler;
use crate::errors::RebuildError;

/// Configuration for the view swap coordinator.
#[derive(Debug, Clone)]
pub struct ViewSwapConfig {
    /// Fewest rows a generation must have to be published.
    pub min_rows: u64,
    /// Reject a generation smaller than this fraction of the published one.
    pub max_shrink_ratio: Option<f64>,
    /// Attempts per statement when it fails transiently.
    pub max_attempts: usize,
    /// Base delay of the exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound of a single backoff delay.
    pub backoff_max: Duration,
}

impl ViewSwapConfig {
    /// The row-count gate a generation or refresh must pass.
    pub fn guard(&self) -> RowCountGuard {
        RowCountGuard {
            min_rows: self.min_rows,
            max_shrink_ratio: self.max_shrink_ratio,
        }
    }
}

impl Default for ViewSwapConfig {
    fn default() -> Self {
        Self {
            min_rows: 1,
            max_shrink_ratio: None,
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of one view name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Idle,
    Building,
    Indexing,
    Validating,
    Swapping,
    Published,
    Failed,
}

impl ViewState {
    /// Whether a build or refresh currently owns the name.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Building | Self::Indexing | Self::Validating | Self::Swapping
        )
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Indexing => "indexing",
            Self::Validating => "validating",
            Self::Swapping => "swapping",
            Self::Published => "published",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a successful view run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewAction {
    /// A new generation was built and swapped in.
    Rebuilt,
    /// The published generation was refreshed in place.
    Refreshed,
}

/// Result of a successful view run.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRebuildOutcome {
    pub view: String,
    pub action: ViewAction,
    /// Rows of the new generation.
    pub rows: Option<u64>,
    /// Rows of the generation it replaced, if one was published.
    pub previous_rows: Option<u64>,
    pub elapsed: Duration,
}

type StateMap = Arc<Mutex<HashMap<String, ViewState>>>;

/// Exclusive claim on a view name.
///
/// Dropping the claim while a step is still running (the future was cancelled)
/// returns the name to `Idle`.
struct ViewClaim {
    states: StateMap,
    view: String,
}

impl ViewClaim {
    fn set(&self, state: ViewState) {
        debug!(view = %self.view, state = %state, "View state changed");
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(self.view.clone(), state);
    }
}

impl Drop for ViewClaim {
    fn drop(&mut self) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if states.get(&self.view).map_or(false, ViewState::is_busy) {
            states.insert(self.view.clone(), ViewState::Idle);
        }
    }
}

/// Coordinates builds and swaps of materialized view generations.
///
/// At most one build or refresh runs per view name; a second request made
/// while one is in progress is rejected with [`RebuildError::RebuildInProgress`].
pub struct ViewSwapCoordinator {
    store: Arc<dyn ViewStore>,
    config: ViewSwapConfig,
    states: StateMap,
    /// Drops of demoted generations, running after their swap committed.
    cleanups: Mutex<Vec<JoinHandle<()>>>,
}

impl ViewSwapCoordinator {
    pub fn new(store: Arc<dyn ViewStore>) -> Self {
        Self::with_config(store, ViewSwapConfig::default())
    }

    pub fn with_config(store: Arc<dyn ViewStore>, config: ViewSwapConfig) -> Self {
        Self {
            store,
            config,
            states: Arc::new(Mutex::new(HashMap::new())),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    /// Current state of a view name.
    pub fn state(&self, view: &str) -> ViewState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(view).copied().unwrap_or(ViewState::Idle)
    }

    /// Whether the view has a published generation.
    pub async fn is_published(&self, view: &str) -> Result<bool, RebuildError> {
        self.store
            .relation_exists(view)
            .await
            .map_err(|e| RebuildError::from_view_store(view, e))
    }

    fn claim(&self, view: &str) -> Result<ViewClaim, RebuildError> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if states.get(view).map_or(false, ViewState::is_busy) {
            return Err(RebuildError::RebuildInProgress(view.to_string()));
        }
        states.insert(view.to_string(), ViewState::Building);
        Ok(ViewClaim {
            states: Arc::clone(&self.states),
            view: view.to_string(),
        })
    }

    /// Build a new generation of `spec` and publish it.
    ///
    /// Any failure discards the staging generation; the published generation
    /// is left untouched.
    #[instrument(skip(self, spec), fields(view = %spec.name))]
    pub async fn rebuild(&self, spec: &ViewSpec) -> Result<ViewRebuildOutcome, RebuildError> {
        let claim = self.claim(&spec.name)?;
        let started = Instant::now();
        let plan = compiler::compile(spec)?;

        info!(staging = %plan.staging, "Building view generation");

        match self.build_and_swap(spec, &plan, &claim).await {
            Ok((rows, previous_rows)) => {
                claim.set(ViewState::Published);
                let elapsed = started.elapsed();
                info!(
                    rows = rows,
                    previous_rows = ?previous_rows,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "View generation published"
                );
                Ok(ViewRebuildOutcome {
                    view: spec.name.clone(),
                    action: ViewAction::Rebuilt,
                    rows: Some(rows),
                    previous_rows,
                    elapsed,
                })
            }
            Err(err) => {
                claim.set(ViewState::Failed);
                error!(error = %err, "View rebuild failed, discarding staging generation");
                if let Err(e) = self.store.drop_view(&plan.staging).await {
                    warn!(staging = %plan.staging, error = %e, "Failed to drop staging generation");
                }
                claim.set(ViewState::Idle);
                Err(err)
            }
        }
    }

    async fn build_and_swap(
        &self,
        spec: &ViewSpec,
        plan: &DdlPlan,
        claim: &ViewClaim,
    ) -> Result<(u64, Option<u64>), RebuildError> {
        let view = spec.name.as_str();

        claim.set(ViewState::Building);
        for statement in plan.build_statements() {
            self.execute(view, statement).await?;
        }

        // Fail fast: the first index that cannot be built stops the generation.
        claim.set(ViewState::Indexing);
        for statement in plan.index_statements() {
            self.execute(view, statement).await?;
        }

        claim.set(ViewState::Validating);
        let rows = self
            .store
            .count_rows(&plan.staging)
            .await
            .map_err(|e| RebuildError::from_view_store(view, e))?
            .unwrap_or(0);
        let previous_rows = self
            .store
            .count_rows(view)
            .await
            .map_err(|e| RebuildError::from_view_store(view, e))?;
        self.validate(view, rows, previous_rows)?;

        claim.set(ViewState::Swapping);
        let published_indexes = match previous_rows {
            Some(_) => self
                .store
                .index_names(view)
                .await
                .map_err(|e| RebuildError::from_view_store(view, e))?,
            None => Vec::new(),
        };
        let swap = compiler::compile_swap(plan, previous_rows.is_some(), &published_indexes);
        self.retry(view, || self.store.execute_atomic(view, &swap))
            .await
            .map_err(|e| RebuildError::from_view_store(view, e))?;

        if previous_rows.is_some() {
            self.schedule_drop(plan.discard.clone());
        }
        Ok((rows, previous_rows))
    }

    /// Validation gate between building and swapping.
    fn validate(&self, view: &str, rows: u64, previous: Option<u64>) -> Result<(), RebuildError> {
        self.config
            .guard()
            .check(rows, previous)
            .map_err(|message| RebuildError::validation_failed(view, message))
    }

    /// Refresh the published generation without blocking readers.
    ///
    /// The refresh passes the same row-count gate as a rebuild; a refresh that
    /// would empty or collapse the view is rolled back.
    #[instrument(skip(self, spec), fields(view = %spec.name))]
    pub async fn refresh_concurrently(
        &self,
        spec: &ViewSpec,
    ) -> Result<ViewRebuildOutcome, RebuildError> {
        let statement = compiler::refresh_statement(spec).ok_or_else(|| {
            RebuildError::spec_validation(format!(
                "view '{}' has no identity column and cannot be refreshed concurrently",
                spec.name
            ))
        })?;

        let claim = self.claim(&spec.name)?;
        let started = Instant::now();
        let guard = self.config.guard();
        let refreshed = self
            .retry(&spec.name, || {
                self.store.execute_guarded(&spec.name, &statement, &guard)
            })
            .await
            .map_err(|e| RebuildError::from_view_store(&spec.name, e));

        match refreshed {
            Ok((previous_rows, rows)) => {
                claim.set(ViewState::Published);
                let elapsed = started.elapsed();
                info!(
                    rows = rows,
                    previous_rows = previous_rows,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "View refreshed"
                );
                Ok(ViewRebuildOutcome {
                    view: spec.name.clone(),
                    action: ViewAction::Refreshed,
                    rows: Some(rows),
                    previous_rows: Some(previous_rows),
                    elapsed,
                })
            }
            Err(err) => {
                claim.set(ViewState::Failed);
                error!(error = %err, "View refresh failed");
                claim.set(ViewState::Idle);
                Err(err)
            }
        }
    }

    /// Wait for the drops of demoted generations to finish.
    pub async fn wait_for_cleanup(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
            cleanups.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cleanup task did not complete");
            }
        }
    }

    fn schedule_drop(&self, discard: String) {
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            match store.drop_view(&discard).await {
                Ok(()) => debug!(view = %discard, "Dropped demoted generation"),
                // Left for the next rebuild, whose swap drops it first.
                Err(e) => warn!(view = %discard, error = %e, "Failed to drop demoted generation"),
            }
        });
        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        cleanups.push(handle);
    }

    async fn execute(&self, view: &str, statement: &DdlStatement) -> Result<(), RebuildError> {
        debug!(statement = %statement.label, "Executing DDL");
        self.retry(view, || self.store.execute(statement))
            .await
            .map_err(|e| RebuildError::from_view_store(view, e))
    }

    /// Run `action`, retrying transient failures with exponential backoff.
    async fn retry<T, F, Fut>(&self, view: &str, action: F) -> Result<T, ViewStoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ViewStoreError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.config.backoff_base_ms)
            .factor(2)
            .max_delay(self.config.backoff_max)
            .map(jitter)
            .take(self.config.max_attempts.saturating_sub(1));

        RetryIf::spawn(strategy, action, |e: &ViewStoreError| {
            let transient = e.is_transient();
            if transient {
                warn!(view = %view, error = %e, "Transient DDL failure, retrying");
            }
            transient
        })
        .await
    }
}
