//! Shared state of one stage invocation.

use super::{FailMode, ParallelOptions, StageSummary};
use crate::cancellation::CancellationToken;
use crate::errors::ItemError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Execution context shared by the workers of one stage.
///
/// Holds the only cross-worker mutable state of a stage: the exception set and
/// the break flag. Two tokens are derived from the caller's token:
///
/// - `cancel` is handed to transforms; it fires only on external cancellation.
/// - `pull` is a child of `cancel`; it also fires when a break is requested,
///   which wakes workers waiting on an empty stream.
#[derive(Debug)]
pub struct ParallelizeCore {
    stage: String,
    options: ParallelOptions,
    exceptions: Mutex<Vec<ItemError>>,
    break_requested: AtomicBool,
    cancel: CancellationToken,
    pull: CancellationToken,
    counters: StageCounters,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct StageCounters {
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    canceled: AtomicUsize,
    faulted: AtomicUsize,
    not_executed: AtomicUsize,
    forwarded: AtomicUsize,
}

/// Per-item outcome tallied by the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    /// Transform completed.
    Succeeded,
    /// Transform observed cancellation.
    Canceled,
    /// Transform failed.
    Faulted,
    /// Item skipped because the stage was stopping.
    NotExecuted,
    /// Upstream outcome forwarded without running the transform.
    Forwarded,
}

impl ParallelizeCore {
    /// Creates the context, linking its cancellation to `parent`.
    #[must_use]
    pub fn new(stage: impl Into<String>, options: ParallelOptions, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let pull = cancel.child_token();
        Self {
            stage: stage.into(),
            options,
            exceptions: Mutex::new(Vec::new()),
            break_requested: AtomicBool::new(false),
            cancel,
            pull,
            counters: StageCounters::default(),
            started_at: Instant::now(),
        }
    }

    /// The stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The stage options.
    #[must_use]
    pub fn options(&self) -> &ParallelOptions {
        &self.options
    }

    /// The fail mode.
    #[must_use]
    pub fn fail_mode(&self) -> FailMode {
        self.options.fail_mode
    }

    /// Token handed to transforms.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token that stops workers from pulling new items.
    #[must_use]
    pub fn pull_token(&self) -> &CancellationToken {
        &self.pull
    }

    /// Adds a fault to the exception set.
    pub fn record_exception(&self, error: ItemError) {
        self.exceptions.lock().push(error);
    }

    /// Stops every worker from starting new items. In-flight transforms keep running.
    pub fn request_break(&self, reason: &str) {
        self.break_requested.store(true, Ordering::SeqCst);
        self.pull.cancel(reason);
    }

    /// Returns true once a break was requested or the stage was cancelled.
    #[must_use]
    pub fn break_requested(&self) -> bool {
        self.break_requested.load(Ordering::SeqCst) || self.pull.is_cancelled()
    }

    /// Returns true if the caller's token fired.
    #[must_use]
    pub fn was_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Snapshot of the recorded faults.
    #[must_use]
    pub fn exceptions(&self) -> Vec<ItemError> {
        self.exceptions.lock().clone()
    }

    /// Counts one item outcome.
    pub fn tally(&self, outcome: Tally) {
        let counter = match outcome {
            Tally::Succeeded => &self.counters.succeeded,
            Tally::Canceled => &self.counters.canceled,
            Tally::Faulted => &self.counters.faulted,
            Tally::NotExecuted => &self.counters.not_executed,
            Tally::Forwarded => &self.counters.forwarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if matches!(outcome, Tally::Succeeded | Tally::Canceled | Tally::Faulted) {
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Builds the stage summary. Call once every worker has finished.
    #[must_use]
    pub fn summary(&self) -> StageSummary {
        StageSummary {
            stage: self.stage.clone(),
            fail_mode: self.options.fail_mode,
            exceptions: self.exceptions(),
            was_canceled: self.was_canceled(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            canceled: self.counters.canceled.load(Ordering::Relaxed),
            faulted: self.counters.faulted.load(Ordering::Relaxed),
            not_executed: self.counters.not_executed.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            duration_ms: self.started_at.elapsed().as_secs_f64() * 1000.0,
        }
    }
}
