//! Cooperative cancellation for running tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::task::WorkerId;

/// Errors from delivering a cancellation request to a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("task on {0} has already finished")]
    AlreadyFinished(WorkerId),
    #[error("task has not started on any worker")]
    NotStarted,
}

/// Shared cancellation flag, one per task.
///
/// Cloning is cheap; every clone observes the same flag. The flag only ever
/// moves from "running" to "cancelled".
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
