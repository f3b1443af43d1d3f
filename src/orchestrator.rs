//! Wires the registry, signal coordinator and worker pool into one run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::RunConfig;
use crate::coordinator::{CoordinatorError, SignalCoordinator};
use crate::pool::{PoolError, WorkerPool};
use crate::registry::TaskRegistry;
use crate::report::{status_lines, RunReport};
use crate::signals::SignalError;
use crate::task::Task;

/// Failures while setting a run up. These abort the process.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Floor for the status poll so a zero interval cannot spin.
const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(10);

type ReadyHook = Box<dyn FnOnce(&SignalCoordinator, &TaskRegistry)>;

pub struct Orchestrator {
    config: RunConfig,
    registry: Arc<TaskRegistry>,
    on_ready: Option<ReadyHook>,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self::with_registry(config, Arc::new(TaskRegistry::new()))
    }

    pub fn with_registry(config: RunConfig, registry: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            registry,
            on_ready: None,
        }
    }

    /// Called on the orchestrating thread once every task is scheduled,
    /// before status polling starts.
    pub fn on_ready(
        mut self,
        hook: impl FnOnce(&SignalCoordinator, &TaskRegistry) + 'static,
    ) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Run `tasks` to completion or cancellation.
    ///
    /// Order matters: the signal set is blocked on this thread before any
    /// other thread exists so every thread inherits the mask, and the mask is
    /// restored only after the pool and the coordinator are gone. If setup
    /// fails part way, the guards unwind it in reverse.
    pub fn run(mut self, tasks: Vec<Task>) -> Result<RunReport, SetupError> {
        let started = Instant::now();
        let signals = self.config.signals.clone();

        let mask = signals.block_current_thread()?;

        let coordinator = SignalCoordinator::builder(Arc::clone(&self.registry))
            .signals(signals.clone())
            .start()?;

        let pool = WorkerPool::builder(Arc::clone(&self.registry))
            .workers(self.config.workers)
            .queue_capacity(self.config.queue_capacity)
            .block_signals(signals)
            .build()?;
        info!(
            "able to run {} concurrent workers; pid {}",
            pool.size(),
            std::process::id()
        );

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            handles.push(pool.schedule(task)?);
        }

        if let Some(hook) = self.on_ready.take() {
            hook(&coordinator, &self.registry);
        }

        // Observability only; nothing depends on these dumps.
        let interval = self.config.status_interval.max(MIN_STATUS_INTERVAL);
        while !pool.wait_all_timeout(interval) {
            let snapshot = self.registry.snapshot();
            if snapshot.is_empty() {
                continue;
            }
            info!("---- state:");
            for line in status_lines(&snapshot) {
                info!(" {}", line);
            }
        }

        info!("awaiting until tasks finish...");
        pool.wait_all();
        let workers = pool.size();
        pool.shutdown();

        if coordinator.is_running() {
            debug!("stopping signal coordinator");
        }
        let coordinator_exit = coordinator.shutdown()?;

        mask.restore()?;

        Ok(RunReport {
            workers,
            elapsed_secs: started.elapsed().as_secs_f64(),
            tasks: handles.iter().map(|h| h.summary()).collect(),
            coordinator: coordinator_exit,
            registry: self.registry.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::StopReason;
    use crate::signals::current_mask;
    use crate::task::{Job, Tally, TaskContext, TaskError, TaskStatus};
    use nix::sys::signal::Signal;
    use std::thread;
    use std::time::Duration;

    struct Ticks(u64);

    impl Job for Ticks {
        fn describe(&self) -> String {
            format!("ticks-{}", self.0)
        }

        fn run(&mut self, ctx: &TaskContext<'_>, tally: &mut Tally) -> Result<(), TaskError> {
            for _ in 0..self.0 {
                ctx.checkpoint()?;
                tally.record("tick");
                ctx.advance(1);
            }
            Ok(())
        }
    }

    fn config() -> RunConfig {
        RunConfig::new()
            .with_workers(2)
            .with_status_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_run_without_signal_restores_mask() {
        thread::spawn(|| {
            let tasks = (0..4).map(|_| Task::new(Ticks(100))).collect();
            let report = Orchestrator::new(config()).run(tasks).unwrap();

            assert_eq!(report.count(TaskStatus::Completed), 4);
            assert_eq!(report.coordinator.reason, StopReason::Requested);
            assert_eq!(report.registry.live, 0);
            assert_eq!(report.registry.registered, 4);
            assert_eq!(report.registry.unregistered, 4);
            assert!(report.registry.peak <= 2);
            assert!(!current_mask().unwrap().contains(Signal::SIGINT));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_ready_hook_sees_coordinator() {
        thread::spawn(|| {
            let tasks = vec![Task::new(Ticks(1))];
            let report = Orchestrator::new(config())
                .on_ready(|coordinator, _registry| {
                    assert!(coordinator.is_running());
                    coordinator.raise(Signal::SIGTRAP).unwrap();
                })
                .run(tasks)
                .unwrap();

            assert_eq!(report.coordinator.reason, StopReason::Requested);
            assert_eq!(report.count(TaskStatus::Completed), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_zero_workers_is_setup_failure() {
        thread::spawn(|| {
            let result = Orchestrator::new(config().with_workers(0)).run(Vec::new());
            assert!(matches!(result, Err(SetupError::Pool(PoolError::NoWorkers))));
            // The guard put the mask back on the way out.
            assert!(!current_mask().unwrap().contains(Signal::SIGTERM));
        })
        .join()
        .unwrap();
    }
}
