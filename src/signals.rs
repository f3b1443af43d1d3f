//! Signal sets and per-thread signal masks.
//!
//! Nothing here installs a signal handler. Signals of interest are blocked on
//! every ordinary thread and collected synchronously by the coordinator
//! thread, so no work ever runs in interrupt context.

use std::fmt;
use std::marker::PhantomData;

use log::warn;
use nix::errno::Errno;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

/// Signals handled by default.
pub const DEFAULT_SIGNALS: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGTRAP,
    Signal::SIGABRT,
];

/// Signals that trigger a cancellation pass by default.
pub const TERMINATING_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGABRT];

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("couldn't block signals: {0}")]
    Block(#[source] Errno),
    #[error("couldn't restore signal mask: {0}")]
    Restore(#[source] Errno),
    #[error("waiting for signals failed: {0}")]
    Wait(#[source] Errno),
    #[error("couldn't deliver {signal} to thread: {source}")]
    Deliver {
        signal: Signal,
        #[source]
        source: Errno,
    },
}

/// What receiving a signal means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Cancel every running task and stop waiting.
    Terminating,
    /// Log and keep waiting.
    Diagnostic,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminating => write!(f, "terminating"),
            Self::Diagnostic => write!(f, "diagnostic"),
        }
    }
}

/// A fixed set of signals together with how each is treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSet {
    entries: Vec<(Signal, SignalKind)>,
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl SignalSet {
    /// An empty set.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// SIGINT, SIGTERM and SIGABRT terminate; SIGILL, SIGFPE, SIGBUS and
    /// SIGTRAP are diagnostic.
    pub fn standard() -> Self {
        DEFAULT_SIGNALS.iter().fold(Self::empty(), |set, sig| {
            let kind = if TERMINATING_SIGNALS.contains(sig) {
                SignalKind::Terminating
            } else {
                SignalKind::Diagnostic
            };
            set.with(*sig, kind)
        })
    }

    /// Add `signal`, or change its kind if it is already present.
    pub fn with(mut self, signal: Signal, kind: SignalKind) -> Self {
        match self.entries.iter_mut().find(|(s, _)| *s == signal) {
            Some(entry) => entry.1 = kind,
            None => self.entries.push((signal, kind)),
        }
        self
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.entries.iter().any(|(s, _)| *s == signal)
    }

    pub fn kind(&self, signal: Signal) -> Option<SignalKind> {
        self.entries
            .iter()
            .find(|(s, _)| *s == signal)
            .map(|(_, kind)| *kind)
    }

    pub fn is_terminating(&self, signal: Signal) -> bool {
        self.kind(signal) == Some(SignalKind::Terminating)
    }

    pub fn signals(&self) -> impl Iterator<Item = Signal> + '_ {
        self.entries.iter().map(|(s, _)| *s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_sigset(&self) -> SigSet {
        let mut set = SigSet::empty();
        for signal in self.signals() {
            set.add(signal);
        }
        set
    }

    /// Block every signal in the set on the calling thread.
    ///
    /// Threads spawned afterwards inherit the blocked mask. The previous mask
    /// is restored when the guard is dropped or [`MaskGuard::restore`]d.
    pub fn block_current_thread(&self) -> Result<MaskGuard, SignalError> {
        MaskGuard::block(&self.to_sigset())
    }

    /// Block the set on the calling thread for the rest of its life.
    ///
    /// Used by pool workers and the coordinator: a thread that unblocked on
    /// its way out could be picked to receive a still-pending signal.
    pub fn block_thread(&self) -> Result<(), SignalError> {
        self.to_sigset().thread_block().map_err(SignalError::Block)
    }

    /// Park the calling thread until one signal of the set is pending, and
    /// consume it. The signals must already be blocked on this thread.
    pub fn wait(&self) -> Result<Signal, SignalError> {
        self.to_sigset().wait().map_err(SignalError::Wait)
    }
}

impl fmt::Display for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.signals().map(|s| s.as_str()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Restores a thread's previous signal mask.
///
/// Signal masks are per thread, so the guard is neither `Send` nor `Sync`.
pub struct MaskGuard {
    previous: Option<SigSet>,
    _not_send: PhantomData<*const ()>,
}

impl MaskGuard {
    fn block(set: &SigSet) -> Result<Self, SignalError> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(set), Some(&mut previous))
            .map_err(SignalError::Block)?;
        Ok(Self {
            previous: Some(previous),
            _not_send: PhantomData,
        })
    }

    /// Put the previous mask back, reporting failure.
    pub fn restore(mut self) -> Result<(), SignalError> {
        self.reset()
    }

    fn reset(&mut self) -> Result<(), SignalError> {
        match self.previous.take() {
            Some(previous) => pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)
                .map_err(SignalError::Restore),
            None => Ok(()),
        }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if let Err(e) = self.reset() {
            warn!("{}", e);
        }
    }
}

/// Mask currently in effect on the calling thread.
pub fn current_mask() -> Result<SigSet, SignalError> {
    SigSet::thread_get_mask().map_err(SignalError::Block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_standard_classification() {
        let set = SignalSet::standard();
        assert_eq!(set.len(), 7);
        for sig in TERMINATING_SIGNALS {
            assert!(set.is_terminating(sig), "{} should terminate", sig);
        }
        for sig in [Signal::SIGILL, Signal::SIGFPE, Signal::SIGBUS, Signal::SIGTRAP] {
            assert_eq!(set.kind(sig), Some(SignalKind::Diagnostic));
        }
        assert_eq!(set.kind(Signal::SIGUSR1), None);
    }

    #[test]
    fn test_with_overrides_kind() {
        let set = SignalSet::standard().with(Signal::SIGTRAP, SignalKind::Terminating);
        assert_eq!(set.len(), 7);
        assert!(set.is_terminating(Signal::SIGTRAP));

        let set = SignalSet::empty().with(Signal::SIGUSR2, SignalKind::Diagnostic);
        assert!(set.contains(Signal::SIGUSR2));
        assert!(!set.contains(Signal::SIGINT));
    }

    #[test]
    fn test_display_lists_names() {
        let set = SignalSet::empty()
            .with(Signal::SIGINT, SignalKind::Terminating)
            .with(Signal::SIGTRAP, SignalKind::Diagnostic);
        assert_eq!(set.to_string(), "SIGINT,SIGTRAP");
    }

    #[test]
    fn test_block_and_restore_on_fresh_thread() {
        // Run on a dedicated thread so the test harness thread's mask is untouched.
        thread::spawn(|| {
            let set = SignalSet::standard();
            let before = current_mask().unwrap();
            assert!(!before.contains(Signal::SIGTRAP));

            let guard = set.block_current_thread().unwrap();
            let during = current_mask().unwrap();
            for sig in set.signals() {
                assert!(during.contains(sig));
            }

            // Children inherit the blocked mask.
            let inherited = thread::spawn(|| current_mask().unwrap().contains(Signal::SIGINT))
                .join()
                .unwrap();
            assert!(inherited);

            guard.restore().unwrap();
            assert!(!current_mask().unwrap().contains(Signal::SIGTRAP));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_guard_drop_restores_mask() {
        thread::spawn(|| {
            {
                let _guard = SignalSet::standard().block_current_thread().unwrap();
                assert!(current_mask().unwrap().contains(Signal::SIGTERM));
            }
            assert!(!current_mask().unwrap().contains(Signal::SIGTERM));
        })
        .join()
        .unwrap();
    }
}
