//! Registry of tasks currently executing, keyed by worker.
//!
//! The registry is the only mutable structure shared between workers, the
//! signal coordinator and the status poller. A single mutex guards it and
//! critical sections never do more than insert, remove or copy.
//!
//! Once [`TaskRegistry::drain`] has run, the registry stays draining: any task
//! registered afterwards is asked to cancel as soon as it is inserted, so
//! queued work stops at its first checkpoint instead of running in full.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::task::{TaskHandle, WorkerId};

/// Lifetime counters, for reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub registered: u64,
    pub unregistered: u64,
    pub duplicates: u64,
    pub live: usize,
    pub peak: usize,
    /// Tasks cancelled on registration because the run was draining.
    pub cancelled_on_register: u64,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<WorkerId, Arc<TaskHandle>>,
    stats: RegistryStats,
    draining: bool,
}

#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` as running on `worker`.
    ///
    /// The returned guard unregisters the worker when dropped. If the worker
    /// already has a task registered, the existing entry is kept and the
    /// returned guard does nothing.
    #[must_use = "dropping the registration unregisters the task immediately"]
    pub fn register(&self, worker: WorkerId, task: Arc<TaskHandle>) -> Registration<'_> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&worker) {
            inner.stats.duplicates += 1;
            drop(inner);
            warn!("{} already has a registered task; ignoring {}", worker, task.label());
            return Registration {
                registry: self,
                worker,
                active: false,
            };
        }

        let draining = inner.draining;
        inner.tasks.insert(worker, Arc::clone(&task));
        inner.stats.registered += 1;
        inner.stats.peak = inner.stats.peak.max(inner.tasks.len());
        if draining {
            inner.stats.cancelled_on_register += 1;
        }
        drop(inner);

        debug!("register {}", worker);
        if draining {
            match task.request_cancel() {
                Ok(()) => info!("{} started while draining; cancelling", task.label()),
                Err(e) => warn!("cancelling {} failed: {}", task.label(), e),
            }
        }
        Registration {
            registry: self,
            worker,
            active: true,
        }
    }

    /// Remove the entry for `worker`, if any.
    pub fn unregister(&self, worker: WorkerId) {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.tasks.remove(&worker).is_some();
            if removed {
                inner.stats.unregistered += 1;
            }
            removed
        };
        if removed {
            debug!("unregister {}", worker);
        }
    }

    /// Tasks running at this instant, ordered by worker.
    pub fn snapshot(&self) -> Vec<Arc<TaskHandle>> {
        let mut entries: Vec<(WorkerId, Arc<TaskHandle>)> = {
            let inner = self.inner.lock();
            inner
                .tasks
                .iter()
                .map(|(worker, task)| (*worker, Arc::clone(task)))
                .collect()
        };
        entries.sort_by_key(|(worker, _)| *worker);
        entries.into_iter().map(|(_, task)| task).collect()
    }

    /// Switch to draining and return the tasks running at this instant.
    ///
    /// Both happen under one lock: every task is either in the returned
    /// snapshot or registers later and is cancelled by [`register`](Self::register).
    pub fn drain(&self) -> Vec<Arc<TaskHandle>> {
        let mut entries: Vec<(WorkerId, Arc<TaskHandle>)> = {
            let mut inner = self.inner.lock();
            inner.draining = true;
            inner
                .tasks
                .iter()
                .map(|(worker, task)| (*worker, Arc::clone(task)))
                .collect()
        };
        entries.sort_by_key(|(worker, _)| *worker);
        entries.into_iter().map(|(_, task)| task).collect()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            live: inner.tasks.len(),
            ..inner.stats
        }
    }
}

/// Scoped registration returned by [`TaskRegistry::register`].
pub struct Registration<'a> {
    registry: &'a TaskRegistry,
    worker: WorkerId,
    active: bool,
}

impl Registration<'_> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// False when the registration was a duplicate and holds no entry.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.active {
            self.registry.unregister(self.worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn handle(label: &str) -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(label))
    }

    fn started(label: &str, worker: WorkerId) -> Arc<TaskHandle> {
        let handle = handle(label);
        handle.start(worker);
        handle
    }

    #[test]
    fn test_register_and_drop() {
        let registry = TaskRegistry::new();
        {
            let reg = registry.register(WorkerId::new(1), handle("a"));
            assert!(reg.is_active());
            assert_eq!(reg.worker(), WorkerId::new(1));
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.unregistered, 1);
        assert_eq!(stats.peak, 1);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = TaskRegistry::new();
        let first = registry.register(WorkerId::new(0), handle("first"));
        {
            let second = registry.register(WorkerId::new(0), handle("second"));
            assert!(!second.is_active());
        }
        // Dropping the inert guard must not remove the original entry.
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].label(), "first");
        assert_eq!(registry.stats().duplicates, 1);

        drop(first);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = TaskRegistry::new();
        let reg = registry.register(WorkerId::new(3), handle("a"));
        registry.unregister(WorkerId::new(3));
        registry.unregister(WorkerId::new(3));
        drop(reg);

        let stats = registry.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.unregistered, 1);
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let registry = TaskRegistry::new();
        let _c = registry.register(WorkerId::new(2), handle("c"));
        let _a = registry.register(WorkerId::new(0), handle("a"));
        let b = registry.register(WorkerId::new(1), handle("b"));

        let snapshot = registry.snapshot();
        drop(b);

        let labels: Vec<_> = snapshot.iter().map(|t| t.label().to_string()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_snapshots_have_no_duplicates() {
        let registry = Arc::new(TaskRegistry::new());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for round in 0..500 {
                        let _reg = registry
                            .register(WorkerId::new(i), handle(&format!("w{}-{}", i, round)));
                    }
                })
            })
            .collect();

        let observer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = registry.snapshot();
                    assert!(snapshot.len() <= 4);
                    let labels: HashSet<_> =
                        snapshot.iter().map(|t| t.label().to_string()).collect();
                    assert_eq!(labels.len(), snapshot.len());
                }
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        observer.join().unwrap();

        let stats = registry.stats();
        assert!(registry.is_empty());
        assert_eq!(stats.registered, 2000);
        assert_eq!(stats.unregistered, 2000);
        assert!(stats.peak <= 4);
    }

    #[test]
    fn test_drain_cancels_later_registrations() {
        let registry = TaskRegistry::new();
        let early = started("early", WorkerId::new(0));
        let _early = registry.register(WorkerId::new(0), Arc::clone(&early));
        assert!(!registry.is_draining());

        let snapshot = registry.drain();
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_draining());
        // Draining only flags the registry; the caller cancels the snapshot.
        assert!(!early.is_cancel_requested());

        let late = started("late", WorkerId::new(1));
        let reg = registry.register(WorkerId::new(1), Arc::clone(&late));
        assert!(reg.is_active());
        assert!(late.is_cancel_requested());
        assert_eq!(registry.stats().cancelled_on_register, 1);
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let registry = TaskRegistry::new();
        let _ = registry.snapshot();
        let late = started("late", WorkerId::new(0));
        let _reg = registry.register(WorkerId::new(0), Arc::clone(&late));
        assert!(!late.is_cancel_requested());
        assert_eq!(registry.stats().cancelled_on_register, 0);
    }
}
