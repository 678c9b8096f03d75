//! Per-protocol service probes and the driver seams they sit on.
//!
//! Probes come in two shapes.  A *single* probe checks one
//! `(address, port, check)` triple and is one-in-flight per worker.  A
//! *batched* probe sweeps an address range for one check with up to
//! `worker_max` requests in flight inside a single worker: ICMP via the
//! [`Pinger`] driver, HTTP/HTTPS via a shared client pair, SNMP via the
//! [`SnmpDriver`].
//!
//! A probe that cannot reach, gets refused or answers garbage reports the
//! service [`Down`](ServiceStatus::Down).  Only a driver that cannot be
//! *constructed* surfaces an [`EngineError::DriverInit`], which aborts the
//! owning job.

pub(crate) mod agent;
pub(crate) mod http;
pub mod icmp;
pub(crate) mod tcp;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::dns::ReverseResolver;
use crate::error::EngineError;
use crate::iprange::{self, IpRange, RangeCursor};
use crate::results::{DiscoveredService, Partial, ResultsCache};
use crate::rule::{Check, CheckId, CheckType, RuleId, ServiceStatus};

/// In-flight window for batched sweeps when the owning job does not bound
/// its workers.
pub(crate) const SWEEP_IN_FLIGHT_MAX: usize = 500;

/// ICMP echo attempts per address.
const PING_RETRIES: u32 = 3;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: ServiceStatus,
    pub value: String,
}

impl ProbeOutcome {
    pub fn up() -> Self {
        Self { status: ServiceStatus::Up, value: String::new() }
    }

    pub fn up_with(value: String) -> Self {
        Self { status: ServiceStatus::Up, value }
    }

    pub fn down() -> Self {
        Self { status: ServiceStatus::Down, value: String::new() }
    }
}

/// Per-address answer of a batched ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    pub addr: IpAddr,
    pub received: bool,
    pub dnsname: Option<String>,
}

/// Batched ICMP driver.  An `Err` is an engine error (socket/session setup),
/// not a host that failed to answer.
pub trait Pinger: Send + Sync {
    fn ping_batch<'a>(
        &'a self,
        targets: &'a [IpAddr],
        retries: u32,
        timeout: Duration,
        allow_redirect: bool,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PingReply>>>;
}

/// SNMP GET driver.  `Ok(Some(value))` is up with a value, `Ok(None)` is
/// down, `Err` is a session-construction failure that aborts the job.
pub trait SnmpDriver: Send + Sync {
    fn get<'a>(
        &'a self,
        check: &'a Check,
        ip: IpAddr,
        port: u16,
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>>;

    /// Drops any cached session state; wired to the IPC cache-reload
    /// request.
    fn reload_cache(&self) {}
}

/// LDAP availability driver; `Ok(true)` means the service answered.
pub trait LdapDriver: Send + Sync {
    fn check<'a>(
        &'a self,
        ip: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, anyhow::Result<bool>>;
}

/// SNMP driver used when no real one is wired in: every check is down.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSnmp;

impl SnmpDriver for NullSnmp {
    fn get<'a>(
        &'a self,
        _check: &'a Check,
        _ip: IpAddr,
        _port: u16,
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        async { Ok(None) }.boxed()
    }
}

/// LDAP driver used when no real one is wired in: every check is down.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLdap;

impl LdapDriver for NullLdap {
    fn check<'a>(
        &'a self,
        _ip: IpAddr,
        _port: u16,
        _timeout: Duration,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        async { Ok(false) }.boxed()
    }
}

/// Per-worker probe context: lazily built HTTP clients plus the shared
/// drivers.  Each worker owns one.
pub(crate) struct Prober {
    source_ip: Option<IpAddr>,
    pinger: Arc<dyn Pinger>,
    snmp: Arc<dyn SnmpDriver>,
    ldap: Arc<dyn LdapDriver>,
    resolver: Arc<dyn ReverseResolver>,
    http_direct: OnceCell<reqwest::Client>,
    http_redirect: OnceCell<reqwest::Client>,
}

impl Prober {
    pub fn new(
        source_ip: Option<IpAddr>,
        pinger: Arc<dyn Pinger>,
        snmp: Arc<dyn SnmpDriver>,
        ldap: Arc<dyn LdapDriver>,
        resolver: Arc<dyn ReverseResolver>,
    ) -> Self {
        Self {
            source_ip,
            pinger,
            snmp,
            ldap,
            resolver,
            http_direct: OnceCell::new(),
            http_redirect: OnceCell::new(),
        }
    }

    pub async fn reverse(&self, ip: IpAddr) -> Option<String> {
        self.resolver.reverse(ip).await
    }

    /// One probe of `(check, ip, port)`.
    pub async fn single_check(
        &self,
        check: &Check,
        ip: IpAddr,
        port: u16,
    ) -> Result<ProbeOutcome, EngineError> {
        let outcome = match check.kind {
            CheckType::Ldap => match self.ldap.check(ip, port, check.timeout).await {
                Ok(true) => ProbeOutcome::up(),
                Ok(false) => ProbeOutcome::down(),
                Err(err) => return Err(EngineError::DriverInit(format!("{err:#}"))),
            },
            CheckType::Agent => agent::check(ip, port, &check.key, check.timeout, self.source_ip).await,
            CheckType::Http | CheckType::Https => {
                let client = self.http_client(check.allow_redirect).await?;
                let status = http::check(client, check.kind, ip, port, check.timeout).await;
                ProbeOutcome { status, value: String::new() }
            }
            CheckType::Icmp => {
                let replies = self
                    .pinger
                    .ping_batch(&[ip], PING_RETRIES, check.timeout, check.allow_redirect)
                    .await
                    .map_err(|err| EngineError::DriverInit(format!("{err:#}")))?;
                if replies.iter().any(|r| r.received) {
                    ProbeOutcome::up()
                } else {
                    ProbeOutcome::down()
                }
            }
            kind if kind.is_snmp() => match self.snmp.get(check, ip, port).await {
                Ok(Some(value)) => ProbeOutcome::up_with(value),
                Ok(None) => ProbeOutcome::down(),
                Err(err) => return Err(EngineError::DriverInit(format!("{err:#}"))),
            },
            _ => tcp::check(check.kind, ip, port, check.timeout, self.source_ip).await,
        };
        Ok(outcome)
    }

    /// Batched sweep of a non-ICMP check over the task's ranges.  Completed
    /// address slices are committed into the cache as they accumulate; the
    /// tail is returned for the task-completion merge.
    #[allow(clippy::too_many_arguments)]
    pub async fn range_sweep(
        &self,
        druleid: RuleId,
        unique_dcheckid: CheckId,
        check: &Check,
        ranges: &[IpRange],
        cursor: &mut RangeCursor,
        worker_max: usize,
        results: &ResultsCache,
        checks_per_ip: u64,
        stop: &AtomicBool,
    ) -> Result<Vec<Partial>, EngineError> {
        let worker_max = worker_max.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut done: Vec<Partial> = Vec::new();

        loop {
            while in_flight.len() < worker_max && !stop.load(Ordering::Relaxed) {
                match iprange::uniq_next(ranges, cursor) {
                    Some(addr) => in_flight.push(self.sweep_one(druleid, unique_dcheckid, check, addr)),
                    None => break,
                }
            }
            let Some(produced) = in_flight.next().await else {
                break;
            };
            done.push(produced?);
            if done.len() >= worker_max {
                results.merge_partial_range(druleid, checks_per_ip, &mut done, false);
            }
        }
        Ok(done)
    }

    /// All ports of one check against one address.
    async fn sweep_one(
        &self,
        druleid: RuleId,
        unique_dcheckid: CheckId,
        check: &Check,
        addr: IpAddr,
    ) -> Result<Partial, EngineError> {
        let mut partial = Partial::new(druleid, unique_dcheckid, addr.to_string());
        for (from, to) in check.port_ranges() {
            for port in from..=to {
                let outcome = match check.kind {
                    CheckType::Http | CheckType::Https => {
                        let client = self.http_client(check.allow_redirect).await?;
                        let status = http::check(client, check.kind, addr, port, check.timeout).await;
                        ProbeOutcome { status, value: String::new() }
                    }
                    kind if kind.is_snmp() => match self.snmp.get(check, addr, port).await {
                        Ok(Some(value)) => ProbeOutcome::up_with(value),
                        Ok(None) => ProbeOutcome::down(),
                        Err(err) => return Err(EngineError::DriverInit(format!("{err:#}"))),
                    },
                    _ => tcp::check(check.kind, addr, port, check.timeout, self.source_ip).await,
                };
                partial.services.push(DiscoveredService {
                    dcheckid: check.dcheckid,
                    port,
                    status: outcome.status,
                    value: outcome.value,
                });
            }
        }
        if partial.services.iter().any(|s| s.status == ServiceStatus::Up) {
            partial.dnsname = self.resolver.reverse(addr).await;
        }
        partial.processed_checks_per_ip = 1;
        Ok(partial)
    }

    /// ICMP sweep of one check over the task's ranges, in `worker_max`
    /// address batches with a trailing flush.
    pub async fn icmp_sweep(
        &self,
        druleid: RuleId,
        unique_dcheckid: CheckId,
        check: &Check,
        ranges: &[IpRange],
        cursor: &mut RangeCursor,
        worker_max: usize,
        stop: &AtomicBool,
    ) -> Result<Vec<Partial>, EngineError> {
        let worker_max = worker_max.max(1);
        let mut batch: Vec<IpAddr> = Vec::with_capacity(worker_max);
        let mut partials: Vec<Partial> = Vec::new();

        while !stop.load(Ordering::Relaxed) {
            match iprange::uniq_next(ranges, cursor) {
                Some(addr) => batch.push(addr),
                None => break,
            }
            if batch.len() < worker_max {
                continue;
            }
            self.ping_flush(druleid, unique_dcheckid, check, &mut batch, &mut partials)
                .await?;
        }
        if !stop.load(Ordering::Relaxed) && !batch.is_empty() {
            self.ping_flush(druleid, unique_dcheckid, check, &mut batch, &mut partials)
                .await?;
        }
        Ok(partials)
    }

    async fn ping_flush(
        &self,
        druleid: RuleId,
        unique_dcheckid: CheckId,
        check: &Check,
        batch: &mut Vec<IpAddr>,
        partials: &mut Vec<Partial>,
    ) -> Result<(), EngineError> {
        let replies = self
            .pinger
            .ping_batch(batch, PING_RETRIES, check.timeout, check.allow_redirect)
            .await
            .map_err(|err| {
                debug!(druleid, "icmp batch of {} failed: {err:#}", batch.len());
                EngineError::DriverInit(format!("{err:#}"))
            })?;
        for reply in replies {
            if !reply.received {
                continue;
            }
            let mut partial = Partial::new(druleid, unique_dcheckid, reply.addr.to_string());
            partial.dnsname = match reply.dnsname {
                Some(name) => Some(name),
                None => self.resolver.reverse(reply.addr).await,
            };
            partial.processed_checks_per_ip = 1;
            partial.services.push(DiscoveredService {
                dcheckid: check.dcheckid,
                port: 0,
                status: ServiceStatus::Up,
                value: String::new(),
            });
            partials.push(partial);
        }
        batch.clear();
        Ok(())
    }

    async fn http_client(&self, allow_redirect: bool) -> Result<&reqwest::Client, EngineError> {
        let cell = if allow_redirect { &self.http_redirect } else { &self.http_direct };
        let source_ip = self.source_ip;
        cell.get_or_try_init(|| async move { http::build_client(allow_redirect, source_ip) })
            .await
            .map_err(|err| EngineError::DriverInit(err.to_string()))
    }
}
