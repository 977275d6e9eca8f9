//! Concurrent chapter acquisition scheduling.
//!
//! The [`Scheduler`] owns one item's acquisition from chapter list to
//! run report:
//!
//! 1. **Enumerate** - resolve the ordered chapter list (snapshot on the
//!    item, or via the source adapter under the retry policy)
//! 2. **Skip** - settle chapters the store already holds at an equal or
//!    better priority, without spending network traffic
//! 3. **Dispatch** - hand remaining chapters to a bounded pool of
//!    workers in ascending position order
//! 4. **Drain** - await in-flight workers, fold outcomes into the report
//!
//! The scheduler holds no completion ledger of its own: resumability
//! comes entirely from the store's `exists` checks, so an interrupted
//! run is resumed simply by running again.
//!
//! # Example
//!
//! ```no_run
//! use bookfetch_core::cancel::CancelToken;
//! use bookfetch_core::scheduler::{ScheduleConfig, Scheduler};
//! use bookfetch_core::store::Item;
//! # async fn example(scheduler: Scheduler, source_id: bookfetch_core::store::SourceId) {
//! let cancel = CancelToken::new();
//! let item = Item::new("book-42");
//!
//! let report = scheduler
//!     .run_with_progress(&item, source_id, &cancel, |progress| {
//!         println!("{progress}");
//!     })
//!     .await;
//! # }
//! ```

mod report;
mod task;

pub use report::{
    AcquisitionOutcome, ChapterFailure, FailureClass, ItemPhase, Progress, RunReport,
};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::fetch::{RateLimiter, RetryError, RetryPolicy, Transport};
use crate::source::SourceRegistry;
use crate::store::{ChapterRef, ChapterStore, Item, SourceId, StoreError};

use task::AcquisitionTask;

/// Minimum worker count.
pub const MIN_WORKERS: usize = 1;

/// Maximum worker count.
pub const MAX_WORKERS: usize = 64;

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// Errors that prevent a run from starting or continuing.
///
/// Per-chapter failures never surface here; they are folded into the
/// [`RunReport`]. This type covers run-level problems only.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Worker count outside `1..=64`.
    #[error("worker count {workers} out of range ({MIN_WORKERS}-{MAX_WORKERS})")]
    InvalidWorkers {
        /// The rejected worker count.
        workers: usize,
    },

    /// The requested source is not in the registry.
    #[error("source {0} is not registered")]
    UnknownSource(SourceId),

    /// Chapter enumeration failed terminally.
    #[error("chapter enumeration failed for item {item_id}")]
    Enumeration {
        /// The item whose chapter list could not be resolved.
        item_id: String,
        /// The terminal fetch failure.
        #[source]
        source: RetryError,
    },

    /// The store rejected a read during work-set computation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tunables for one scheduler instance.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Concurrent acquisition workers, `1..=64`.
    pub workers: usize,
    /// Whether to skip chapters the store already satisfies.
    /// Disabling forces a re-fetch of everything.
    pub skip_existing: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            skip_existing: true,
        }
    }
}

impl ScheduleConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidWorkers`] if the worker count is
    /// outside `1..=64`.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(ScheduleError::InvalidWorkers {
                workers: self.workers,
            });
        }
        Ok(())
    }
}

/// Drives concurrent acquisition of an item's chapters.
///
/// Cheap to clone; all heavyweight collaborators are behind `Arc`.
#[derive(Clone)]
pub struct Scheduler {
    store: ChapterStore,
    registry: Arc<SourceRegistry>,
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    config: ScheduleConfig,
}

impl Scheduler {
    /// Creates a scheduler over the given collaborators.
    ///
    /// The source registry is taken from the store, so both resolve
    /// priorities identically.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidWorkers`] if the configuration is
    /// rejected.
    pub fn new(
        store: ChapterStore,
        transport: Arc<dyn Transport>,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        config: ScheduleConfig,
    ) -> Result<Self, ScheduleError> {
        config.validate()?;
        let registry = Arc::clone(store.registry());
        Ok(Self {
            store,
            registry,
            transport,
            rate_limiter,
            retry_policy,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Runs one item's acquisition without progress reporting.
    ///
    /// # Errors
    ///
    /// Returns a [`ScheduleError`] when the run cannot start; individual
    /// chapter failures are reported in the [`RunReport`] instead.
    pub async fn run(
        &self,
        item: &Item,
        source_id: SourceId,
        cancel: &CancelToken,
    ) -> Result<RunReport, ScheduleError> {
        self.run_with_progress(item, source_id, cancel, |_| {}).await
    }

    /// Runs one item's acquisition, reporting progress after every
    /// settled chapter.
    ///
    /// The first progress snapshot arrives after the skip pass (so a
    /// fully-acquired item immediately reports complete), then once per
    /// completed worker. `done` counts acquired, skipped and failed
    /// chapters alike.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::UnknownSource`] for an unregistered
    /// source, [`ScheduleError::Enumeration`] when the chapter list
    /// cannot be resolved, and [`ScheduleError::Store`] when a store
    /// read fails during work-set computation.
    #[instrument(skip(self, item, on_progress), fields(item = %item.id, source = %source_id))]
    pub async fn run_with_progress<F>(
        &self,
        item: &Item,
        source_id: SourceId,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<RunReport, ScheduleError>
    where
        F: FnMut(Progress),
    {
        let source = self
            .registry
            .get(source_id)
            .ok_or(ScheduleError::UnknownSource(source_id))?;
        let priority = source.priority;
        let adapter = source.adapter_handle();

        info!(phase = %ItemPhase::Enumerating, "resolving chapter list");
        let chapters = match &item.chapters {
            Some(snapshot) => snapshot.clone(),
            None => {
                let listed = {
                    self.rate_limiter.acquire(adapter.throttle_key()).await;
                    let transport = Arc::clone(&self.transport);
                    let adapter = Arc::clone(&adapter);
                    let item_id = item.id.clone();
                    self.retry_policy
                        .run(cancel, move || {
                            let transport = Arc::clone(&transport);
                            let adapter = Arc::clone(&adapter);
                            let item_id = item_id.clone();
                            async move {
                                adapter.fetch_chapter_list(transport.as_ref(), &item_id).await
                            }
                        })
                        .await
                };
                match listed {
                    Ok(chapters) => chapters,
                    Err(RetryError::Cancelled { .. }) => {
                        info!(phase = %ItemPhase::Failed, "cancelled during enumeration");
                        return Ok(RunReport {
                            cancelled: true,
                            ..RunReport::default()
                        });
                    }
                    Err(source) => {
                        warn!(phase = %ItemPhase::Failed, error = %source, "enumeration failed");
                        return Err(ScheduleError::Enumeration {
                            item_id: item.id.clone(),
                            source,
                        });
                    }
                }
            }
        };

        // Range restriction, then ascending reading order for dispatch.
        let mut work: Vec<ChapterRef> = chapters
            .into_iter()
            .filter(|chapter| item.range.admits(chapter.position))
            .collect();
        work.sort_by_key(|chapter| chapter.position);
        let total = work.len();

        let mut report = RunReport::default();

        // Skip pass: chapters with a copy at this priority or better are
        // settled without touching the network.
        let mut pending = Vec::with_capacity(work.len());
        if self.config.skip_existing {
            for chapter in work {
                if self.store.exists_at_or_better(&chapter.id, priority).await? {
                    report.record(AcquisitionOutcome::Skipped);
                } else {
                    pending.push(chapter);
                }
            }
        } else {
            pending = work;
        }
        on_progress(Progress {
            done: report.settled(),
            total,
        });

        info!(
            phase = %ItemPhase::Dispatching,
            total,
            skipped = report.skipped,
            to_fetch = pending.len(),
            workers = self.config.workers,
            "dispatching chapter tasks"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut join_set: JoinSet<Option<AcquisitionOutcome>> = JoinSet::new();

        let task = AcquisitionTask {
            store: self.store.clone(),
            transport: Arc::clone(&self.transport),
            rate_limiter: Arc::clone(&self.rate_limiter),
            retry_policy: self.retry_policy.clone(),
            adapter,
            source_id,
            item_id: item.id.clone(),
            cancel: cancel.clone(),
        };

        for chapter in pending {
            // Settle any already-finished workers so progress flows
            // while we wait for capacity.
            while let Some(result) = join_set.try_join_next() {
                settle(&mut report, total, result, &mut on_progress);
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.cancelled = true;
                break;
            };

            let task = task.clone();
            join_set.spawn(async move {
                let outcome = task.acquire(&chapter).await;
                drop(permit);
                outcome
            });
        }

        info!(phase = %ItemPhase::Draining, in_flight = join_set.len(), "draining workers");
        while let Some(result) = join_set.join_next().await {
            settle(&mut report, total, result, &mut on_progress);
        }

        // Cancelled runs still finish cleanly once in-flight work drains.
        info!(phase = %ItemPhase::Completed, %report, "run finished");
        Ok(report)
    }

    /// Runs several items in sequence against one source.
    ///
    /// Items are isolated from each other: an enumeration failure on one
    /// does not abort its siblings. Cancellation stops the whole batch;
    /// unstarted items report as cancelled.
    #[instrument(skip(self, items), fields(count = items.len(), source = %source_id))]
    pub async fn run_many(
        &self,
        items: &[Item],
        source_id: SourceId,
        cancel: &CancelToken,
    ) -> Vec<(String, Result<RunReport, ScheduleError>)> {
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            if cancel.is_cancelled() {
                results.push((
                    item.id.clone(),
                    Ok(RunReport {
                        cancelled: true,
                        ..RunReport::default()
                    }),
                ));
                continue;
            }

            let result = self.run(item, source_id, cancel).await;
            if let Err(error) = &result {
                warn!(item = %item.id, %error, "item run failed, continuing with siblings");
            }
            results.push((item.id.clone(), result));
        }

        results
    }
}

/// Folds one worker's result into the report and emits progress.
fn settle<F>(
    report: &mut RunReport,
    total: usize,
    result: Result<Option<AcquisitionOutcome>, JoinError>,
    on_progress: &mut F,
) where
    F: FnMut(Progress),
{
    match result {
        Ok(Some(outcome)) => {
            report.record(outcome);
            on_progress(Progress {
                done: report.settled(),
                total,
            });
        }
        // The worker was interrupted by cancellation; the chapter stays
        // unsettled for a later run to pick up.
        Ok(None) => report.cancelled = true,
        Err(error) => warn!(%error, "acquisition worker failed to join"),
    }
}
