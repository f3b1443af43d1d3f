//! Signal coordinator: the one thread that receives process signals.
//!
//! ```text
//!            non-terminating signal
//!             ┌───────────────┐
//!             ▼               │
//!   ┌──────────────┐   ┌────────────┐
//!   │ Blocked-wait │──►│ Diagnostic │
//!   └──────────────┘   └────────────┘
//!      │         │
//!      │ terminating signal / wait error
//!      │         ▼
//!      │   ┌────────────┐
//!      │   │ Cancelling │── snapshot registry, cancel each task
//!      │   └────────────┘
//!      │ stop()  │
//!      ▼         ▼
//!   ┌──────────────────┐
//!   │     Stopped      │
//!   └──────────────────┘
//! ```
//!
//! The coordinator never installs a handler. It blocks its signal set and
//! parks in `sigwait`, so logging, locking and allocation all happen on an
//! ordinary thread that merely woke up because a signal arrived.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use log::{debug, error, info, warn};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::Signal;
use serde::{Serialize, Serializer};

use crate::registry::TaskRegistry;
use crate::signals::{SignalError, SignalKind, SignalSet};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("couldn't create signal coordinator thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("signal coordinator exited before it was ready")]
    Startup,
    #[error("signal coordinator thread panicked")]
    Panicked,
}

/// Why the coordinator left its wait loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// A terminating signal arrived.
    Signal {
        #[serde(serialize_with = "serialize_signal")]
        signal: Signal,
    },
    /// Stopped on request during a graceful shutdown.
    Requested,
    /// The wait primitive failed; handled like a terminating signal.
    WaitFailed { error: String },
}

/// Result of one cancellation broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelPass {
    pub requested: usize,
    pub failed: usize,
}

/// Final state of a coordinator, returned by [`SignalCoordinator::join`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorExit {
    pub reason: StopReason,
    #[serde(serialize_with = "serialize_opt_signal")]
    pub last_signal: Option<Signal>,
    pub signals_received: u64,
    pub cancellation: CancelPass,
}

fn serialize_signal<S: Serializer>(signal: &Signal, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(signal.as_str())
}

fn serialize_opt_signal<S: Serializer>(signal: &Option<Signal>, s: S) -> Result<S::Ok, S::Error> {
    match signal {
        Some(signal) => s.serialize_some(signal.as_str()),
        None => s.serialize_none(),
    }
}

/// Put the registry into draining mode and request cancellation of every
/// task running at that instant.
///
/// Failures for individual workers are logged and counted; the broadcast
/// always covers the whole snapshot. Tasks registering afterwards are
/// cancelled by the registry itself and are not counted here.
pub fn cancel_all(registry: &TaskRegistry) -> CancelPass {
    let tasks = registry.drain();
    info!("cancel running tasks ({})", tasks.len());

    let mut pass = CancelPass::default();
    for task in tasks {
        match task.request_cancel() {
            Ok(()) => pass.requested += 1,
            Err(e) => {
                warn!("cancelling {} failed: {}", task.label(), e);
                pass.failed += 1;
            }
        }
    }
    pass
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    stop_requested: AtomicBool,
    last_signal: AtomicI32,
    received: AtomicU64,
}

impl Shared {
    fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::SeqCst) {
            0 => None,
            n => Signal::try_from(n).ok(),
        }
    }
}

/// Configures and starts a [`SignalCoordinator`].
pub struct CoordinatorBuilder {
    registry: Arc<TaskRegistry>,
    signals: SignalSet,
    wake: Signal,
}

impl CoordinatorBuilder {
    pub fn signals(mut self, signals: SignalSet) -> Self {
        self.signals = signals;
        self
    }

    /// Signal used to wake the coordinator for a requested stop. Added to the
    /// set as diagnostic if it is not already part of it.
    pub fn wake_signal(mut self, signal: Signal) -> Self {
        self.wake = signal;
        self
    }

    /// Spawn the coordinator thread.
    ///
    /// Returns once the thread has blocked its signal set, so signals can be
    /// aimed at it immediately.
    pub fn start(self) -> Result<SignalCoordinator, CoordinatorError> {
        let signals = if self.signals.contains(self.wake) {
            self.signals
        } else {
            self.signals.with(self.wake, SignalKind::Diagnostic)
        };

        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = channel::bounded(1);
        let registry = self.registry;
        let thread_shared = Arc::clone(&shared);
        let thread_signals = signals.clone();
        let wake = self.wake;
        let thread = thread::Builder::new()
            .name("sigdrain-signals".to_string())
            .spawn(move || {
                if let Err(e) = thread_signals.block_thread() {
                    thread_shared.running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(e));
                    return None;
                }
                let _ = ready_tx.send(Ok(pthread_self()));
                Some(wait_loop(
                    &thread_signals,
                    wake,
                    &registry,
                    &thread_shared,
                    || thread_signals.wait(),
                ))
            })
            .map_err(|e| {
                shared.running.store(false, Ordering::SeqCst);
                CoordinatorError::Spawn(e)
            })?;

        let pthread = match ready_rx.recv() {
            Ok(Ok(pthread)) => pthread,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CoordinatorError::Startup);
            }
        };

        info!("signal coordinator started, waiting for {}", signals);
        Ok(SignalCoordinator {
            shared,
            thread: Some(thread),
            pthread,
            wake: self.wake,
        })
    }
}

/// Drive the coordinator state machine until it stops.
///
/// `wait` yields the next consumed signal. A received signal is always
/// recorded and acted on before a pending stop request is honoured; only the
/// wake signal itself is dropped silently.
fn wait_loop(
    signals: &SignalSet,
    wake: Signal,
    registry: &TaskRegistry,
    shared: &Shared,
    mut wait: impl FnMut() -> Result<Signal, SignalError>,
) -> CoordinatorExit {
    let mut cancellation = CancelPass::default();
    let reason = loop {
        let received = wait();
        let stopping = shared.stop_requested.load(Ordering::SeqCst);

        match received {
            Ok(signal) if stopping && signal == wake => {
                debug!("signal coordinator stop requested");
                break StopReason::Requested;
            }
            Ok(signal) => {
                shared.last_signal.store(signal as i32, Ordering::SeqCst);
                shared.received.fetch_add(1, Ordering::SeqCst);
                if signals.is_terminating(signal) {
                    info!("received signal {}", signal);
                    cancellation = cancel_all(registry);
                    break StopReason::Signal { signal };
                }
                warn!("received signal {}; diagnostic only, still waiting", signal);
                if stopping {
                    debug!("signal coordinator stop requested");
                    break StopReason::Requested;
                }
            }
            Err(e) if stopping => {
                debug!("{} while stopping; ignored", e);
                break StopReason::Requested;
            }
            Err(e) => {
                error!("{}; cancelling running tasks", e);
                cancellation = cancel_all(registry);
                break StopReason::WaitFailed {
                    error: e.to_string(),
                };
            }
        }
    };

    shared.running.store(false, Ordering::SeqCst);
    CoordinatorExit {
        reason,
        last_signal: shared.last_signal(),
        signals_received: shared.received.load(Ordering::SeqCst),
        cancellation,
    }
}

/// Handle to the running coordinator thread.
pub struct SignalCoordinator {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Option<CoordinatorExit>>>,
    pthread: Pthread,
    wake: Signal,
}

impl SignalCoordinator {
    /// Coordinator for the standard signal set, woken with SIGTERM on stop.
    pub fn builder(registry: Arc<TaskRegistry>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            registry,
            signals: SignalSet::standard(),
            wake: Signal::SIGTERM,
        }
    }

    /// True while the wait loop is active.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Most recent signal received, for diagnostics.
    pub fn last_signal(&self) -> Option<Signal> {
        self.shared.last_signal()
    }

    pub fn signals_received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    /// Deliver `signal` to the coordinator thread only.
    pub fn raise(&self, signal: Signal) -> Result<(), SignalError> {
        pthread_kill(self.pthread, signal).map_err(|source| SignalError::Deliver { signal, source })
    }

    /// Ask a coordinator that is still waiting to stop without cancelling
    /// anything. Does nothing if it has already stopped.
    pub fn stop(&self) -> Result<(), CoordinatorError> {
        if !self.is_running() {
            return Ok(());
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        match self.raise(self.wake) {
            // Lost the race with a terminating signal; the thread is gone.
            Err(_) if !self.is_running() => Ok(()),
            result => Ok(result?),
        }
    }

    /// Wait for the coordinator thread to finish.
    pub fn join(mut self) -> Result<CoordinatorExit, CoordinatorError> {
        let thread = self.thread.take().ok_or(CoordinatorError::Startup)?;
        thread
            .join()
            .map_err(|_| CoordinatorError::Panicked)?
            .ok_or(CoordinatorError::Startup)
    }

    /// Stop if still running, then join.
    pub fn shutdown(self) -> Result<CoordinatorExit, CoordinatorError> {
        self.stop()?;
        self.join()
    }
}

impl Drop for SignalCoordinator {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // A thread that could not be woken is still parked in sigwait, so
        // joining it would hang; it is left detached and dies with the process.
        if let Err(e) = self.stop() {
            warn!("{}; leaving signal coordinator thread detached", e);
            return;
        }
        if thread.join().is_err() {
            warn!("{}", CoordinatorError::Panicked);
        }
    }
}
