//! Run configuration.
//!
//! Settings can be configured via:
//! - CLI arguments: `--workers`, `--tasks`, `--queue-capacity`, `--status-interval-ms`
//! - Environment variables: `SIGDRAIN_WORKERS`, `SIGDRAIN_TASKS`,
//!   `SIGDRAIN_QUEUE_CAPACITY`, `SIGDRAIN_STATUS_INTERVAL_MS`
//!
//! CLI arguments take precedence over environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::pool::{default_workers, DEFAULT_QUEUE_CAPACITY};
use crate::signals::SignalSet;

pub const DEFAULT_TASKS: usize = 4;
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Worker threads in the pool.
    pub workers: usize,
    /// Tasks scheduled against the input.
    pub tasks: usize,
    /// Bound on queued tasks.
    pub queue_capacity: usize,
    /// Period of the registry status dump.
    pub status_interval: Duration,
    /// Signals owned by the coordinator.
    pub signals: SignalSet,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tasks: DEFAULT_TASKS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            status_interval: DEFAULT_STATUS_INTERVAL,
            signals: SignalSet::standard(),
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            workers: parse_positive(&lookup, "SIGDRAIN_WORKERS").unwrap_or(defaults.workers),
            tasks: parse_positive(&lookup, "SIGDRAIN_TASKS").unwrap_or(defaults.tasks),
            queue_capacity: parse_positive(&lookup, "SIGDRAIN_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            status_interval: parse_positive::<u64>(&lookup, "SIGDRAIN_STATUS_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.status_interval),
            signals: defaults.signals,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_signals(mut self, signals: SignalSet) -> Self {
        self.signals = signals;
        self
    }

    /// Merge with CLI overrides. CLI values take precedence.
    pub fn with_overrides(
        mut self,
        workers: Option<usize>,
        tasks: Option<usize>,
        queue_capacity: Option<usize>,
        status_interval_ms: Option<u64>,
    ) -> Self {
        if let Some(w) = workers {
            self.workers = w;
        }
        if let Some(t) = tasks {
            self.tasks = t;
        }
        if let Some(c) = queue_capacity {
            self.queue_capacity = c;
        }
        if let Some(ms) = status_interval_ms {
            self.status_interval = Duration::from_millis(ms);
        }
        self
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            warn!("Ignoring invalid {}='{}'; expected a positive integer", key, raw);
            None
        }
    }
}
