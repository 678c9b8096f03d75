//! Engine error taxonomy.
//!
//! A probe that times out, gets refused or answers garbage is *not* an
//! error: the service is reported [`Down`](crate::rule::ServiceStatus::Down).
//! Errors are reserved for the conditions below, and workers never propagate
//! them upwards — they translate them into per-job aborts whose text ends up
//! on the rule's persisted error string.

use std::io;

use thiserror::Error;

/// The closed set of failure kinds the engine can produce.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule's configuration could not be resolved (bad update interval,
    /// bad global timeout).  Aborts the current cycle for that rule and is
    /// persisted as a rule-level error.
    #[error("discovery rule \"{rule}\": {reason}")]
    RuleConfig { rule: String, reason: String },

    /// The shared queue had no capacity left for the rule's expansion.  The
    /// rule is retried at its next natural due time.
    #[error("discoverer queue is full, skipping discovery rule")]
    QueueFull,

    /// A protocol driver could not be brought up (ICMP socket, HTTP client,
    /// SNMP session).  Fails the task and aborts the owning job.
    #[error("cannot initialize probe driver: {0}")]
    DriverInit(String),

    /// Failure on the IPC surface; logged, the peer is released.
    #[error("ipc failure: {0}")]
    Ipc(#[from] io::Error),

    /// A result commit raced a rule revision change; the contribution is
    /// silently dropped.
    #[error("discovery rule revision changed, result dropped")]
    StaleRevision,

    /// The engine could not be brought up (socket bind, worker startup
    /// handshake).  Init-time only.
    #[error("cannot start discovery engine: {0}")]
    Startup(String),
}
