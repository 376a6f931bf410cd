//! Runtime configuration for workers and pools.
//!
//! # Environment Variables
//!
//! - `FORKPOOL_WORKERS` - Pool size (default: logical core count)
//! - `FORKPOOL_MODE` - Execution mode: process, simulation
//! - `FORKPOOL_NOTIFY` - Completion delivery: signals, polling
//! - `FORKPOOL_OVERFLOW` - Allow queueing on busy workers: true, false

use std::str::FromStr;
use std::time::Duration;

use crate::error::{PoolError, Result};
use crate::worker::supports_forking;

/// Pool size used when the core count cannot be determined.
pub const FALLBACK_WORKER_COUNT: usize = 4;

/// Number of workers to use when none is configured.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKER_COUNT)
}

/// How a worker executes its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Forked child process connected by a socket pair.
    Process,
    /// Same-process, synchronous fallback.
    Simulation,
}

impl ExecutionMode {
    /// Process mode when the platform can fork, simulation otherwise.
    ///
    /// See [`supports_forking`]: on the unix targets the crate builds for this
    /// always picks [`Process`](Self::Process).
    pub fn detect() -> Self {
        if supports_forking() {
            Self::Process
        } else {
            Self::Simulation
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::detect()
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "fork" => Ok(Self::Process),
            "simulation" | "sim" | "inline" => Ok(Self::Simulation),
            _ => Err(format!(
                "Unknown execution mode: '{}'. Valid options: process, simulation",
                s
            )),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Simulation => write!(f, "simulation"),
        }
    }
}

/// How a pool learns that workers finished payloads or exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Notification {
    /// Workers raise SIGUSR1/SIGUSR2; the pool scans on each event.
    #[default]
    Signals,
    /// No signals; the pool scans all workers on a fixed tick.
    Polling,
}

impl FromStr for Notification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "signals" | "signal" => Ok(Self::Signals),
            "polling" | "poll" => Ok(Self::Polling),
            _ => Err(format!(
                "Unknown notification mode: '{}'. Valid options: signals, polling",
                s
            )),
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signals => write!(f, "signals"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Configuration for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: ExecutionMode,
    /// Sleep between empty reads inside the worker process.
    pub child_poll_interval: Duration,
    /// Stop the worker when it is dropped while still active.
    pub self_managed: bool,
    /// Raise SIGUSR1/SIGUSR2 at the parent.
    pub notify_parent: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::detect(),
            child_poll_interval: Duration::from_millis(100),
            self_managed: true,
            notify_parent: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_child_poll_interval(mut self, interval: Duration) -> Self {
        self.child_poll_interval = interval;
        self
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial target size.
    pub size: usize,
    /// Queue payloads on busy workers when none is idle.
    pub overflow: bool,
    pub notification: Notification,
    pub mode: ExecutionMode,
    /// Sleep between checks for an idle worker in waiting dispatch.
    pub wait_period: Duration,
    /// Sleep between shrink passes in waiting resize.
    pub shrink_check_interval: Duration,
    /// Listener tick.
    pub event_tick: Duration,
    /// Completion scan interval when no signal arrived (signal mode only).
    pub fallback_scan_interval: Duration,
    /// How long teardown waits for graceful exits before killing.
    pub shutdown_grace: Duration,
    /// Sleep between empty reads inside worker processes.
    pub child_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_worker_count(),
            overflow: false,
            notification: Notification::Signals,
            mode: ExecutionMode::detect(),
            wait_period: Duration::from_millis(10),
            shrink_check_interval: Duration::from_secs(1),
            event_tick: Duration::from_millis(5),
            fallback_scan_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            child_poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_overflow(mut self, overflow: bool) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_notification(mut self, notification: Notification) -> Self {
        self.notification = notification;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_shrink_check_interval(mut self, interval: Duration) -> Self {
        self.shrink_check_interval = interval;
        self
    }

    pub fn with_child_poll_interval(mut self, interval: Duration) -> Self {
        self.child_poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Invalid values are reported rather than silently ignored.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("FORKPOOL_WORKERS") {
            self.size = value.trim().parse().map_err(|_| {
                PoolError::Config(format!("FORKPOOL_WORKERS must be a number, got '{}'", value))
            })?;
        }
        if let Some(value) = lookup("FORKPOOL_MODE") {
            self.mode = value.parse().map_err(PoolError::Config)?;
        }
        if let Some(value) = lookup("FORKPOOL_NOTIFY") {
            self.notification = value.parse().map_err(PoolError::Config)?;
        }
        if let Some(value) = lookup("FORKPOOL_OVERFLOW") {
            self.overflow = parse_flag(&value).ok_or_else(|| {
                PoolError::Config(format!("FORKPOOL_OVERFLOW must be a boolean, got '{}'", value))
            })?;
        }
        Ok(self)
    }

    /// Per-worker configuration derived from this pool configuration.
    pub(crate) fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            mode: self.mode,
            child_poll_interval: self.child_poll_interval,
            self_managed: false,
            notify_parent: self.notification == Notification::Signals,
        }
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
