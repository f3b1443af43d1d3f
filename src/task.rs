//! Tasks: cancellable units of work with observable progress.
//!
//! A [`Task`] pairs a [`Job`] (the actual work) with a shared [`TaskHandle`]
//! that other threads use to watch progress and request cancellation. The
//! handle outlives the task: the pool hands it back from `schedule` so the
//! caller can inspect the outcome after the pool drains.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::cancel::{CancelError, CancelToken};
use crate::registry::TaskRegistry;

/// Opaque identity of a pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Errors a job can end with.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("couldn't open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Job(String),
}

/// Word frequency table accumulated by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    counts: BTreeMap<String, u64>,
}

/// One entry of [`Tally::top`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordFrequency {
    pub word: String,
    pub count: u64,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, word: &str) {
        *self.counts.entry(word.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, word: &str) -> u64 {
        self.counts.get(word).copied().unwrap_or(0)
    }

    /// Total number of recorded words.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    /// The `n` most frequent words, ties broken alphabetically.
    pub fn top(&self, n: usize) -> Vec<WordFrequency> {
        let mut entries: Vec<_> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(n)
            .map(|(word, count)| WordFrequency {
                word: word.clone(),
                count: *count,
            })
            .collect()
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(Tally),
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Coarse task state used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Shared view of a task, safe to read from any thread.
#[derive(Debug)]
pub struct TaskHandle {
    label: String,
    worker: OnceLock<WorkerId>,
    started: OnceLock<Instant>,
    started_at: OnceLock<DateTime<Utc>>,
    finished_after: OnceLock<Duration>,
    progress: AtomicU64,
    cancel: CancelToken,
    outcome: Mutex<Option<TaskOutcome>>,
}

impl TaskHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            worker: OnceLock::new(),
            started: OnceLock::new(),
            started_at: OnceLock::new(),
            finished_after: OnceLock::new(),
            progress: AtomicU64::new(0),
            cancel: CancelToken::new(),
            outcome: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The worker running (or that ran) this task. `None` before start.
    pub fn worker(&self) -> Option<WorkerId> {
        self.worker.get().copied()
    }

    /// Units of progress completed so far (lines, for the word counter).
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Wall time since start, frozen once the task finishes.
    pub fn elapsed(&self) -> Option<Duration> {
        if let Some(done) = self.finished_after.get() {
            return Some(*done);
        }
        self.started.get().map(Instant::elapsed)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.get().copied()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.lock().clone()
    }

    pub fn status(&self) -> TaskStatus {
        match self.outcome.lock().as_ref() {
            Some(outcome) => outcome.status(),
            None if self.worker.get().is_some() => TaskStatus::Running,
            None => TaskStatus::Pending,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the task to stop at its next checkpoint.
    pub fn request_cancel(&self) -> Result<(), CancelError> {
        let worker = self.worker().ok_or(CancelError::NotStarted)?;
        if self.is_finished() {
            return Err(CancelError::AlreadyFinished(worker));
        }
        if self.cancel.cancel() {
            debug!("Cancellation requested for {} on {}", self.label, worker);
        }
        Ok(())
    }

    /// Point-in-time summary for reporting.
    pub fn summary(&self) -> TaskSummary {
        let outcome = self.outcome();
        let (words, distinct_words, top_words, error) = match &outcome {
            Some(TaskOutcome::Completed(tally)) => {
                (Some(tally.total()), Some(tally.distinct()), tally.top(5), None)
            }
            Some(TaskOutcome::Failed(e)) => (None, None, Vec::new(), Some(e.clone())),
            _ => (None, None, Vec::new(), None),
        };
        TaskSummary {
            label: self.label.clone(),
            worker: self.worker(),
            status: self.status(),
            lines: self.progress(),
            words,
            distinct_words,
            elapsed_secs: self.elapsed().map(|d| d.as_secs_f64()),
            started_at: self.started_at(),
            top_words,
            error,
        }
    }

    pub(crate) fn start(&self, worker: WorkerId) {
        if self.worker.set(worker).is_err() {
            warn!("{} was already bound to a worker; keeping the first", self.label);
            return;
        }
        let _ = self.started.set(Instant::now());
        let _ = self.started_at.set(Utc::now());
    }

    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return;
        }
        if let Some(started) = self.started.get() {
            let _ = self.finished_after.set(started.elapsed());
        }
        *slot = Some(outcome);
    }
}

/// Serializable snapshot of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub label: String,
    pub worker: Option<WorkerId>,
    pub status: TaskStatus,
    pub lines: u64,
    pub words: Option<u64>,
    pub distinct_words: Option<usize>,
    pub elapsed_secs: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_words: Vec<WordFrequency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a job sees while it runs.
pub struct TaskContext<'a> {
    handle: &'a TaskHandle,
}

impl<'a> TaskContext<'a> {
    /// Cancellation point. Jobs call this at least once per unit of progress.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.handle.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// Record `units` of completed progress.
    pub fn advance(&self, units: u64) {
        self.handle.progress.fetch_add(units, Ordering::Relaxed);
    }

    pub fn worker(&self) -> Option<WorkerId> {
        self.handle.worker()
    }
}

/// The work a task performs.
pub trait Job: Send {
    /// Short human-readable description, used as the task label.
    fn describe(&self) -> String;

    /// Do the work, calling `ctx.checkpoint()` at least once per unit of
    /// progress and accumulating results into `tally`.
    fn run(&mut self, ctx: &TaskContext<'_>, tally: &mut Tally) -> Result<(), TaskError>;
}

/// A job plus its shared handle, ready to be scheduled on a pool.
pub struct Task {
    handle: Arc<TaskHandle>,
    job: Box<dyn Job>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.handle.label())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(job: impl Job + 'static) -> Self {
        let label = job.describe();
        Self::with_label(label, job)
    }

    pub fn with_label(label: impl Into<String>, job: impl Job + 'static) -> Self {
        Self {
            handle: Arc::new(TaskHandle::new(label)),
            job: Box::new(job),
        }
    }

    pub fn handle(&self) -> Arc<TaskHandle> {
        Arc::clone(&self.handle)
    }

    /// Run the job on `worker`.
    ///
    /// The task is registered for exactly the duration of this call: the
    /// registration guard is released on every exit path, unwinding included.
    pub fn run(self, worker: WorkerId, registry: &TaskRegistry) {
        let Task { handle, mut job } = self;

        handle.start(worker);
        let _registration = registry.register(worker, Arc::clone(&handle));

        let ctx = TaskContext { handle: &handle };
        let mut tally = Tally::new();
        let outcome = match job.run(&ctx, &mut tally) {
            Ok(()) => {
                info!(
                    "{} finished on {}: {} lines, {} words in {:.3}s",
                    handle.label(),
                    worker,
                    handle.progress(),
                    tally.total(),
                    handle.elapsed().unwrap_or_default().as_secs_f64()
                );
                TaskOutcome::Completed(tally)
            }
            Err(TaskError::Cancelled) => {
                info!(
                    "{} cancelled on {} after {} lines",
                    handle.label(),
                    worker,
                    handle.progress()
                );
                TaskOutcome::Cancelled
            }
            Err(e) => {
                error!("{} on {} ended early: {}", handle.label(), worker, e);
                TaskOutcome::Failed(e.to_string())
            }
        };
        handle.finish(outcome);
    }
}
