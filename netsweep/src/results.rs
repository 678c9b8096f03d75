//! Per-host result aggregation with revision-safe outstanding counts.
//!
//! Two maps under one mutex: `(rule, ip)` to the in-progress partial result
//! and `(rule, ip)` to the number of checks still expected for that address.
//! A worker commit that finds no outstanding entry raced a revision purge
//! and is dropped silently; a partial becomes drainable once its count
//! reaches zero (or its rule has been deleted).
//!
//! The entry with an empty `ip` doubles as the rule-level sentinel: workers
//! register it when a job is removed, the scheduler registers it for rules
//! that failed before expansion, and the drainer turns it into a rule-state
//! update.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use crate::error::EngineError;
use crate::iprange::{self, IpRange, RangeCursor};
use crate::rule::{CheckId, RuleId, ServiceStatus};
use crate::unix_time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredService {
    pub dcheckid: CheckId,
    pub port: u16,
    pub status: ServiceStatus,
    pub value: String,
}

/// An in-progress `(rule, ip)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Partial {
    pub druleid: RuleId,
    pub ip: String,
    pub unique_dcheckid: CheckId,
    pub dnsname: Option<String>,
    pub services: Vec<DiscoveredService>,
    pub clock: i64,
    /// How many of the owning task's per-address checks produced this
    /// partial so far; compared against the task weight at commit time.
    pub processed_checks_per_ip: u64,
}

impl Partial {
    pub fn new(druleid: RuleId, unique_dcheckid: CheckId, ip: String) -> Self {
        Self {
            druleid,
            ip,
            unique_dcheckid,
            dnsname: None,
            services: Vec::new(),
            clock: unix_time(),
            processed_checks_per_ip: 0,
        }
    }
}

type Key = (RuleId, String);

#[derive(Debug, Default)]
struct CacheInner {
    results: HashMap<Key, Partial>,
    outstanding: HashMap<Key, u64>,
}

#[derive(Debug, Default)]
pub(crate) struct ResultsCache {
    inner: Mutex<CacheInner>,
}

/// One drain pass worth of ready partials plus the service accounting the
/// scheduler reports.
#[derive(Debug, Default)]
pub(crate) struct DrainBatch {
    pub ready: Vec<Partial>,
    pub total_services: u64,
    pub drained_services: u64,
}

impl ResultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("results lock poisoned")
    }

    /// Registers the rule-level sentinel entry.
    pub fn register_sentinel(&self, druleid: RuleId) {
        self.lock().register_host(druleid, 0, "");
    }

    /// Adds per-address outstanding counts for a freshly expanded rule.
    /// Existing entries are kept, mirroring insert-if-absent semantics.
    pub fn add_outstanding<I>(&self, counts: I)
    where
        I: IntoIterator<Item = (Key, u64)>,
    {
        let mut inner = self.lock();
        for (key, count) in counts {
            inner.outstanding.entry(key).or_insert(count);
        }
    }

    /// Drops outstanding counts for deleted rules (sorted slice); in-flight
    /// contributions for them will find nothing to decrement and get
    /// discarded.
    pub fn purge_outstanding(&self, druleids: &[RuleId]) {
        if druleids.is_empty() {
            return;
        }
        self.lock()
            .outstanding
            .retain(|(rule, _), _| druleids.binary_search(rule).is_err());
    }

    /// Commits one single-probe result.  `Err(StaleRevision)` means the rule
    /// was purged while the probe ran; the caller drops the contribution.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_single(
        &self,
        druleid: RuleId,
        unique_dcheckid: CheckId,
        ip: &str,
        dcheckid: CheckId,
        port: u16,
        status: ServiceStatus,
        value: String,
        dnsname: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.decrement(druleid, ip, 1).is_none() {
            return Err(EngineError::StaleRevision);
        }
        let partial = inner.register_host(druleid, unique_dcheckid, ip);
        if let Some(dns) = dnsname {
            if partial.dnsname.as_deref().unwrap_or("").is_empty() && !dns.is_empty() {
                partial.dnsname = Some(dns);
            }
        }
        partial.services.push(DiscoveredService { dcheckid, port, status, value });
        Ok(())
    }

    /// Commits an address slice of a batched task.  Partials whose processed
    /// count does not match the task weight are left untouched unless
    /// `force`; partials racing a revision purge are dropped in place.
    pub fn merge_partial_range(
        &self,
        druleid: RuleId,
        checks_per_ip: u64,
        partials: &mut Vec<Partial>,
        force: bool,
    ) {
        let mut inner = self.lock();
        let mut idx = 0;
        while idx < partials.len() {
            if !force && partials[idx].processed_checks_per_ip != checks_per_ip {
                idx += 1;
                continue;
            }
            let processed = partials[idx].processed_checks_per_ip;
            if inner.decrement(druleid, &partials[idx].ip, processed).is_none() {
                trace!(druleid, ip = %partials[idx].ip, "revision changed, slice dropped");
                partials.remove(idx);
                continue;
            }
            let partial = partials.remove(idx);
            inner.move_value(partial);
        }
    }

    /// Task-completion commit: walks every address of the task's range,
    /// decrements its weight and either merges the produced partial or, when
    /// nothing is outstanding anymore, registers the empty host-down marker.
    pub fn merge_full(
        &self,
        druleid: RuleId,
        unique_dcheckid: CheckId,
        checks_per_ip: u64,
        ranges: &[IpRange],
        partials: Vec<Partial>,
    ) {
        let mut by_ip: HashMap<String, Partial> = partials
            .into_iter()
            .map(|p| (p.ip.clone(), p))
            .collect();

        let mut inner = self.lock();
        let mut cursor = RangeCursor::default();
        while let Some(addr) = iprange::uniq_next(ranges, &mut cursor) {
            let ip = addr.to_string();
            let Some(rest) = inner.decrement(druleid, &ip, checks_per_ip) else {
                continue;
            };
            match by_ip.remove(&ip) {
                Some(partial) => inner.move_value(partial),
                None => {
                    if rest == 0 {
                        inner.register_host(druleid, unique_dcheckid, &ip);
                    }
                }
            }
        }
    }

    /// Moves every drainable partial out: rule deleted (`deleted` is a
    /// sorted slice), or batch budget not yet spent and nothing outstanding.
    /// Rules held back (outstanding work or exhausted budget) are collected
    /// into `incomplete`.
    pub fn drain_ready(
        &self,
        deleted: &[RuleId],
        errored: &[RuleId],
        batch: u64,
        incomplete: &mut HashSet<RuleId>,
    ) -> DrainBatch {
        let mut out = DrainBatch::default();
        let mut inner = self.lock();

        for rule in deleted {
            inner.outstanding.retain(|(r, _), _| r != rule);
        }

        let keys: Vec<Key> = inner.results.keys().cloned().collect();
        for key in keys {
            if deleted.binary_search(&key.0).is_ok() {
                inner.results.remove(&key);
                continue;
            }
            let services = inner.results[&key].services.len() as u64;
            out.total_services += services;

            let pending = inner.outstanding.get(&key).map(|c| *c != 0).unwrap_or(false);
            if out.drained_services >= batch || pending {
                incomplete.insert(key.0);
                continue;
            }
            out.drained_services += services;
            inner.outstanding.remove(&key);
            if let Some(partial) = inner.results.remove(&key) {
                out.ready.push(partial);
            }
        }

        inner.results.retain(|(rule, _), _| !errored.contains(rule));
        inner.outstanding.retain(|(rule, _), _| !errored.contains(rule));

        out
    }

    #[cfg(test)]
    pub fn outstanding_total(&self) -> u64 {
        self.lock().outstanding.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.results.is_empty() && inner.outstanding.values().all(|c| *c == 0)
    }
}

impl CacheInner {
    /// Decrements the outstanding count; `None` signals the entry is gone
    /// (revision purge) or already exhausted.
    fn decrement(&mut self, druleid: RuleId, ip: &str, count: u64) -> Option<u64> {
        let entry = self.outstanding.get_mut(&(druleid, ip.to_string()))?;
        if *entry == 0 {
            return None;
        }
        *entry = entry.saturating_sub(count);
        Some(*entry)
    }

    /// Upserts an empty partial; existing entries are returned untouched.
    fn register_host(&mut self, druleid: RuleId, unique_dcheckid: CheckId, ip: &str) -> &mut Partial {
        self.results
            .entry((druleid, ip.to_string()))
            .or_insert_with(|| {
                let mut partial = Partial::new(druleid, unique_dcheckid, ip.to_string());
                partial.dnsname = Some(String::new());
                partial
            })
    }

    /// Folds a produced partial into the cache.  A missing DNS name becomes
    /// empty; an empty stored name may be upgraded by a non-empty one, never
    /// the reverse.
    fn move_value(&mut self, mut src: Partial) {
        let dns = src.dnsname.take().unwrap_or_default();
        let key = (src.druleid, src.ip.clone());
        match self.results.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                src.dnsname = Some(dns);
                slot.insert(src);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let dst = slot.get_mut();
                if dst.dnsname.as_deref().unwrap_or("").is_empty() && !dns.is_empty() {
                    dst.dnsname = Some(dns);
                }
                dst.services.append(&mut src.services);
            }
        }
    }
}
