//! Status dumps and the end-of-run report.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::coordinator::{CoordinatorExit, StopReason};
use crate::registry::RegistryStats;
use crate::task::{TaskHandle, TaskStatus, TaskSummary};

/// One line per running task, as printed by the periodic status dump.
pub fn status_lines(tasks: &[Arc<TaskHandle>]) -> Vec<String> {
    tasks
        .iter()
        .map(|task| {
            let worker = task
                .worker()
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{} {} processed lines {} elapsed seconds {:.2}",
                worker,
                task.label(),
                task.progress(),
                task.elapsed().unwrap_or_default().as_secs_f64()
            )
        })
        .collect()
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workers: usize,
    pub elapsed_secs: f64,
    pub tasks: Vec<TaskSummary>,
    pub coordinator: CoordinatorExit,
    pub registry: RegistryStats,
}

impl RunReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// True if a terminating signal (or a failed wait) cut the run short.
    pub fn interrupted(&self) -> bool {
        !matches!(self.coordinator.reason, StopReason::Requested)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} tasks on {} workers in {:.2}s: {} completed, {} cancelled, {} failed",
            self.tasks.len(),
            self.workers,
            self.elapsed_secs,
            self.count(TaskStatus::Completed),
            self.count(TaskStatus::Cancelled),
            self.count(TaskStatus::Failed),
        );

        for task in &self.tasks {
            let worker = task
                .worker
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = write!(
                out,
                "  {} [{}] {}: {} lines",
                task.label, worker, task.status, task.lines
            );
            if let Some(words) = task.words {
                let _ = write!(
                    out,
                    ", {} words ({} distinct)",
                    words,
                    task.distinct_words.unwrap_or(0)
                );
            }
            if let Some(secs) = task.elapsed_secs {
                let _ = write!(out, ", {:.3}s", secs);
            }
            if let Some(error) = &task.error {
                let _ = write!(out, ": {}", error);
            }
            out.push('\n');

            if !task.top_words.is_empty() {
                let top: Vec<_> = task
                    .top_words
                    .iter()
                    .map(|w| format!("{}={}", w.word, w.count))
                    .collect();
                let _ = writeln!(out, "    top: {}", top.join(" "));
            }
        }

        let reason = match &self.coordinator.reason {
            StopReason::Signal { signal } => format!("stopped by {}", signal),
            StopReason::Requested => "stopped on request".to_string(),
            StopReason::WaitFailed { error } => format!("wait failed: {}", error),
        };
        let _ = writeln!(
            out,
            "signal coordinator {}; {} signal(s) received, {} cancellation(s) requested, {} failed",
            reason,
            self.coordinator.signals_received,
            self.coordinator.cancellation.requested,
            self.coordinator.cancellation.failed,
        );
        let _ = writeln!(
            out,
            "registry: {} registered, {} unregistered, peak {}, {} cancelled on start",
            self.registry.registered,
            self.registry.unregistered,
            self.registry.peak,
            self.registry.cancelled_on_register
        );
        out
    }
}
