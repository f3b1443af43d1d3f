//! Fixed-size pool of worker threads running [`Task`]s.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::registry::TaskRegistry;
use crate::signals::SignalSet;
use crate::task::{Task, TaskHandle, TaskOutcome, WorkerId};

/// Default bound on queued, not yet running tasks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("couldn't create worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker pool is shut down")]
    Closed,
}

/// Rejection from [`WorkerPool::try_schedule`], handing the task back.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("worker pool queue is full")]
    Full(Task),
    #[error("worker pool is shut down")]
    Closed(Task),
}

/// Number of tasks scheduled but not yet finished.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Host parallelism, falling back to a single worker.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configures a [`WorkerPool`].
pub struct PoolBuilder {
    registry: Arc<TaskRegistry>,
    workers: usize,
    queue_capacity: usize,
    block_signals: Option<SignalSet>,
}

impl PoolBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Block `signals` on every worker for its whole lifetime.
    pub fn block_signals(mut self, signals: SignalSet) -> Self {
        self.block_signals = Some(signals);
        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        if self.workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (sender, receiver) = channel::bounded::<Task>(self.queue_capacity);
        let pending = Arc::new(Pending::default());
        let mut pool = WorkerPool {
            sender: Some(sender),
            workers: Vec::with_capacity(self.workers),
            pending: Arc::clone(&pending),
            size: self.workers,
        };

        for index in 0..self.workers {
            let id = WorkerId::new(index);
            let receiver = receiver.clone();
            let registry = Arc::clone(&self.registry);
            let pending = Arc::clone(&pending);
            let signals = self.block_signals.clone();
            let handle = thread::Builder::new()
                .name(format!("sigdrain-{}", id))
                .spawn(move || {
                    if let Some(signals) = signals {
                        if let Err(e) = signals.block_thread() {
                            error!("{}: {}", id, e);
                        }
                    }
                    worker_loop(id, receiver, &registry, &pending);
                })
                // Dropping the partial pool closes the queue and joins what was spawned.
                .map_err(PoolError::Spawn)?;
            pool.workers.push(handle);
        }

        debug!("started {} workers", pool.size);
        Ok(pool)
    }
}

fn worker_loop(id: WorkerId, receiver: Receiver<Task>, registry: &TaskRegistry, pending: &Pending) {
    for task in receiver.iter() {
        let handle = task.handle();
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(id, registry)));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            error!("{} panicked on {}: {}", handle.label(), id, message);
            handle.finish(TaskOutcome::Failed(format!("panicked: {}", message)));
        }
        pending.done();
    }
    debug!("{} exiting", id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded set of worker threads.
///
/// The pool knows nothing about cancellation; tasks are cancelled through
/// their handles.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
    size: usize,
}

impl WorkerPool {
    /// Pool sized to the host's parallelism.
    pub fn builder(registry: Arc<TaskRegistry>) -> PoolBuilder {
        PoolBuilder {
            registry,
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            block_signals: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks scheduled and not yet finished.
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Queue `task`, blocking only while the queue is at capacity.
    pub fn schedule(&self, task: Task) -> Result<Arc<TaskHandle>, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        let handle = task.handle();
        self.pending.add();
        if sender.send(task).is_err() {
            self.pending.done();
            return Err(PoolError::Closed);
        }
        debug!("scheduled {}", handle.label());
        Ok(handle)
    }

    /// Queue `task` without blocking.
    pub fn try_schedule(&self, task: Task) -> Result<Arc<TaskHandle>, ScheduleError> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(ScheduleError::Closed(task));
        };
        let handle = task.handle();
        self.pending.add();
        match sender.try_send(task) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(task)) => {
                self.pending.done();
                Err(ScheduleError::Full(task))
            }
            Err(TrySendError::Disconnected(task)) => {
                self.pending.done();
                Err(ScheduleError::Closed(task))
            }
        }
    }

    /// Block until every scheduled task has finished.
    pub fn wait_all(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Like [`wait_all`](Self::wait_all) but gives up after `timeout`.
    /// Returns true if the pool drained.
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Close the queue and join every worker. Queued tasks still run.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
