//! Orchestrator module for the surface indexer.
//!
//! Runs every view rebuild and the index rebuild of one invocation as
//! concurrent units of work, propagates Ctrl-C as cancellation and collects
//! an aggregate report.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use surface_indexer_shared::{IndexBuildStats, RebuildMode, ViewSpec};
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant};
use tracing::{error, info, instrument, warn};

use crate::errors::RebuildError;
use crate::pipeline::IndexBuildPipeline;
use crate::publisher::AliasSwapCoordinator;
use crate::views::{ViewRebuildOutcome, ViewSwapCoordinator};

/// Outcome of one view.
#[derive(Debug)]
pub struct ViewReport {
    pub view: String,
    /// `Ok(None)` when the view was skipped for this mode.
    pub outcome: Result<Option<ViewRebuildOutcome>, RebuildError>,
}

impl ViewReport {
    fn is_success(&self) -> bool {
        match self.outcome {
            Ok(_) => true,
            Err(ref e) => e.is_rejection(),
        }
    }
}

/// Outcome of the index rebuild.
#[derive(Debug)]
pub struct IndexReport {
    /// Generation written by a full run, or the alias for incremental runs.
    pub target: String,
    pub outcome: Result<IndexBuildStats, RebuildError>,
}

/// Aggregate result of one invocation.
#[derive(Debug)]
pub struct RebuildReport {
    pub mode: RebuildMode,
    pub views: Vec<ViewReport>,
    pub index: Option<IndexReport>,
    pub cancelled: bool,
}

impl RebuildReport {
    /// Whether every unit of work published (or was rejected as a duplicate).
    pub fn is_success(&self) -> bool {
        self.views.iter().all(ViewReport::is_success)
            && self.index.as_ref().map_or(true, |i| i.outcome.is_ok())
    }

    /// Log one line per unit of work.
    pub fn log_summary(&self) {
        for report in &self.views {
            match report.outcome {
                Ok(Some(ref outcome)) => info!(
                    view = %report.view,
                    action = ?outcome.action,
                    rows = ?outcome.rows,
                    previous_rows = ?outcome.previous_rows,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "View published"
                ),
                Ok(None) => info!(view = %report.view, mode = %self.mode, "View skipped"),
                Err(ref e) => error!(view = %report.view, error = %e, "View failed"),
            }
        }
        if let Some(ref index) = self.index {
            match index.outcome {
                Ok(ref stats) => info!(
                    target = %index.target,
                    processed = stats.processed(),
                    indexed = stats.indexed,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    deleted = stats.deleted,
                    "Index rebuild succeeded"
                ),
                Err(ref e) => error!(target = %index.target, error = %e, "Index rebuild failed"),
            }
        }
    }
}

/// The index half of a rebuild.
pub struct IndexRebuild {
    pub pipeline: IndexBuildPipeline,
    pub publisher: AliasSwapCoordinator,
    /// Source query producing one row per document.
    pub query: String,
}

/// Coordinates view and index rebuilds.
pub struct Orchestrator {
    mode: RebuildMode,
    views: Option<(Arc<ViewSwapCoordinator>, Vec<ViewSpec>)>,
    index: Option<IndexRebuild>,
    cancel_tx: watch::Sender<bool>,
    progress_interval: Duration,
}

impl Orchestrator {
    pub fn new(mode: RebuildMode) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            mode,
            views: None,
            index: None,
            cancel_tx,
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn with_views(mut self, coordinator: Arc<ViewSwapCoordinator>, specs: Vec<ViewSpec>) -> Self {
        self.views = Some((coordinator, specs));
        self
    }

    pub fn with_index(mut self, index: IndexRebuild) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_progress_interval(mut self, every: Duration) -> Self {
        self.progress_interval = every;
        self
    }

    /// Ask running pipelines to stop at their next batch boundary.
    ///
    /// View DDL already sent to the database runs to completion.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Run every configured rebuild to completion.
    #[instrument(skip(self), fields(mode = %self.mode))]
    pub async fn run(&self) -> RebuildReport {
        info!(
            views = self.views.as_ref().map_or(0, |(_, specs)| specs.len()),
            index = self.index.is_some(),
            "Starting surface rebuild"
        );

        let work = async { tokio::join!(self.run_views(), self.run_index()) };
        tokio::pin!(work);

        let mut progress_timer = interval(self.progress_interval);
        progress_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prev_rows: u64 = 0;
        let mut prev_time = Instant::now();
        let mut interrupted = false;

        let (views, index) = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    warn!("Received shutdown signal, stopping at the next batch boundary");
                    interrupted = true;
                    self.cancel();
                }
                _ = progress_timer.tick() => {
                    if let Some(ref index) = self.index {
                        let progress = index.pipeline.progress();
                        let rows = progress.rows_read.load(Ordering::Relaxed);
                        let now = Instant::now();
                        let elapsed_secs = now.duration_since(prev_time).as_secs_f64();
                        let rows_per_sec = if elapsed_secs > 0.0 {
                            (rows.saturating_sub(prev_rows) as f64) / elapsed_secs
                        } else {
                            0.0
                        };

                        info!(
                            rows_read = rows,
                            indexed = progress.indexed.load(Ordering::Relaxed),
                            failed = progress.failed.load(Ordering::Relaxed),
                            skipped = progress.skipped.load(Ordering::Relaxed),
                            rows_per_sec = format!("{:.2}", rows_per_sec),
                            "Index build progress"
                        );

                        prev_rows = rows;
                        prev_time = now;
                    }
                }
            }
        };

        if let Some((ref coordinator, _)) = self.views {
            coordinator.wait_for_cleanup().await;
        }

        let report = RebuildReport {
            mode: self.mode,
            views,
            index,
            cancelled: *self.cancel_tx.borrow(),
        };
        report.log_summary();
        report
    }

    async fn run_views(&self) -> Vec<ViewReport> {
        let (coordinator, specs) = match self.views {
            Some((ref coordinator, ref specs)) => (coordinator, specs),
            None => return Vec::new(),
        };

        join_all(specs.iter().map(|spec| async move {
            ViewReport {
                view: spec.name.clone(),
                outcome: self.run_view(coordinator, spec).await,
            }
        }))
        .await
    }

    async fn run_view(
        &self,
        coordinator: &ViewSwapCoordinator,
        spec: &ViewSpec,
    ) -> Result<Option<ViewRebuildOutcome>, RebuildError> {
        match self.mode {
            RebuildMode::Full => coordinator.rebuild(spec).await.map(Some),
            RebuildMode::Incremental if spec.refresh && spec.has_identity() => {
                if coordinator.is_published(&spec.name).await? {
                    coordinator.refresh_concurrently(spec).await.map(Some)
                } else {
                    info!(view = %spec.name, "View not published yet, building first generation");
                    coordinator.rebuild(spec).await.map(Some)
                }
            }
            RebuildMode::Incremental => Ok(None),
        }
    }

    async fn run_index(&self) -> Option<IndexReport> {
        let index = self.index.as_ref()?;
        let cancel = self.cancel_tx.subscribe();

        let report = match self.mode {
            RebuildMode::Full => {
                let generation = match index.publisher.allocate().await {
                    Ok(generation) => generation,
                    Err(e) => {
                        return Some(IndexReport {
                            target: index.publisher.alias().to_string(),
                            outcome: Err(e),
                        })
                    }
                };

                let outcome = match index
                    .pipeline
                    .run(&index.query, &generation.name, RebuildMode::Full, cancel)
                    .await
                {
                    Ok(stats) => index.publisher.publish(&generation, &stats).await.map(|()| stats),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(_) => {
                        if let Err(e) = index.publisher.sweep(None).await {
                            warn!(error = %e, "Failed to sweep orphaned generations");
                        }
                    }
                    Err(_) => {
                        if let Err(e) = index.publisher.discard(&generation).await {
                            warn!(index = %generation.name, error = %e, "Failed to discard generation");
                        }
                    }
                }

                IndexReport {
                    target: generation.name,
                    outcome,
                }
            }
            RebuildMode::Incremental => {
                let alias = index.publisher.alias().to_string();
                let outcome = index
                    .pipeline
                    .run(&index.query, &alias, RebuildMode::Incremental, cancel)
                    .await;
                IndexReport {
                    target: alias,
                    outcome,
                }
            }
        };
        Some(report)
    }
}
