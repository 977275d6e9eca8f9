//! Run reports, per-chapter outcomes and progress snapshots.

use std::fmt;

use crate::fetch::FailureKind;

/// Why a chapter ended as a failure in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient failures kept happening until attempts ran out.
    RetriesExhausted,
    /// A permanent failure (404, malformed URL, legal block).
    Permanent,
    /// The source demands authentication this run does not have.
    AuthRequired,
    /// Content was fetched but the adapter could not extract it.
    Extraction,
    /// The chapter was acquired but could not be persisted.
    Store,
}

impl FailureClass {
    /// Short stable label for logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Permanent => "permanent",
            Self::AuthRequired => "auth_required",
            Self::Extraction => "extraction",
            Self::Store => "store",
        }
    }

    /// Maps a terminal fetch failure kind to its report class.
    #[must_use]
    pub fn from_failure_kind(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient | FailureKind::RateLimited => Self::RetriesExhausted,
            FailureKind::Permanent => Self::Permanent,
            FailureKind::NeedsAuth => Self::AuthRequired,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chapter's terminal failure, carried in the run report.
#[derive(Debug, Clone)]
pub struct ChapterFailure {
    /// Which chapter failed.
    pub chapter_id: String,
    /// Why it failed.
    pub class: FailureClass,
    /// Human-readable failure message.
    pub message: String,
    /// Fetch attempts made before giving up (0 for non-fetch failures).
    pub attempts: u32,
}

impl fmt::Display for ChapterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}, {} attempts): {}",
            self.chapter_id, self.class, self.attempts, self.message
        )
    }
}

/// Terminal outcome of one chapter's acquisition.
#[derive(Debug, Clone)]
pub enum AcquisitionOutcome {
    /// Fetched, extracted and persisted.
    Acquired,
    /// A satisfactory copy already existed; no network traffic spent.
    Skipped,
    /// Gave up on this chapter.
    Failed(ChapterFailure),
}

/// Phase of an item's acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    /// Not yet started.
    Pending,
    /// Resolving the chapter list.
    Enumerating,
    /// Dispatching chapter tasks to workers.
    Dispatching,
    /// All tasks dispatched; waiting for in-flight ones to finish.
    Draining,
    /// Run finished; per-chapter outcomes are in the report.
    Completed,
    /// The run could not start (enumeration failed or config rejected).
    Failed,
}

impl ItemPhase {
    /// Short stable label for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enumerating => "enumerating",
            Self::Dispatching => "dispatching",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot delivered to the caller after every completion.
///
/// `done` counts acquired, skipped and failed chapters alike: it is the
/// number of chapters with a settled outcome, out of `total` in the work
/// set. Skipped chapters are settled up front, so a fully-acquired item
/// reports complete progress immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Chapters with a terminal outcome so far.
    pub done: usize,
    /// Chapters in this run's work set.
    pub total: usize,
}

impl Progress {
    /// Completion as a fraction in `[0, 1]`. An empty work set is
    /// complete by definition.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.done, self.total)
    }
}

/// Summary of one item's acquisition run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Chapters fetched, extracted and persisted this run.
    pub acquired: usize,
    /// Chapters skipped because a satisfactory copy already existed.
    pub skipped: usize,
    /// Chapters that ended in failure, with their reasons.
    pub failures: Vec<ChapterFailure>,
    /// Whether the run was interrupted by cancellation.
    pub cancelled: bool,
}

impl RunReport {
    /// Chapters that ended in failure.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Total chapters with a terminal outcome.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.acquired + self.skipped + self.failed()
    }

    /// True when every chapter in the work set settled without failure
    /// and the run was not cancelled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }

    /// Failures caused by the store rather than the source.
    ///
    /// Surfaced separately so a persistence incident is not mistaken
    /// for source trouble.
    pub fn store_warnings(&self) -> impl Iterator<Item = &ChapterFailure> {
        self.failures
            .iter()
            .filter(|failure| failure.class == FailureClass::Store)
    }

    /// Folds one outcome into the counters.
    pub(crate) fn record(&mut self, outcome: AcquisitionOutcome) {
        match outcome {
            AcquisitionOutcome::Acquired => self.acquired += 1,
            AcquisitionOutcome::Skipped => self.skipped += 1,
            AcquisitionOutcome::Failed(failure) => self.failures.push(failure),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acquired {}, skipped {}, failed {}{}",
            self.acquired,
            self.skipped,
            self.failed(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}
