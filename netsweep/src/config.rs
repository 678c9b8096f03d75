//! Engine configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one engine instance, supplied at init.  There is no
/// CLI or environment surface here; the host process owns that.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of workers draining the queue.  Clamped to at least 1.
    pub workers: usize,

    /// Ceiling on the number of pending checks admitted to the queue.
    /// A rule whose expansion would exceed the remaining capacity is skipped
    /// with a transient queue-full error.
    pub queue_max: u64,

    /// Base scheduler tick; the scheduler never sleeps longer than this.
    pub delay_tick: Duration,

    /// Maximum number of service results drained per cycle, so that the
    /// persistence sink is not starved.
    pub batch_results: u64,

    /// Interval a rule falls back to after a configuration error.
    pub default_interval: Duration,

    /// Source address for outgoing probes, when pinned.
    pub source_ip: Option<IpAddr>,

    /// Unix socket path for the IPC service.  `None` disables the service.
    pub ipc_path: Option<PathBuf>,

    /// How long init waits for all workers to register.
    pub startup_timeout: Duration,
}

impl EngineConfig {
    pub const DEFAULT_QUEUE_MAX: u64 = 100_000;
    pub const DEFAULT_DELAY_TICK: Duration = Duration::from_secs(60);
    pub const DEFAULT_BATCH_RESULTS: u64 = 1000;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            queue_max: Self::DEFAULT_QUEUE_MAX,
            delay_tick: Self::DEFAULT_DELAY_TICK,
            batch_results: Self::DEFAULT_BATCH_RESULTS,
            default_interval: Self::DEFAULT_INTERVAL,
            source_ip: None,
            ipc_path: None,
            startup_timeout: Self::STARTUP_TIMEOUT,
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.queue_max == 0 {
            self.queue_max = Self::DEFAULT_QUEUE_MAX;
        }
        if self.batch_results == 0 {
            self.batch_results = Self::DEFAULT_BATCH_RESULTS;
        }
        if self.delay_tick.is_zero() {
            self.delay_tick = Self::DEFAULT_DELAY_TICK;
        }
        if self.default_interval.is_zero() {
            self.default_interval = Self::DEFAULT_INTERVAL;
        }
        self
    }
}
