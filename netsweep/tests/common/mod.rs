//! In-memory collaborators for engine tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use netsweep::dns::ReverseResolver;
use netsweep::probe::{PingReply, Pinger, SnmpDriver};
use netsweep::rule::{Check, Rule, RuleId, ServiceStatus};
use netsweep::store::{
    DbHost, DiscoveryEvent, DiscoveryStore, EventObject, EventSink, ItemKind, RuleStore,
    StoreHandle,
};

// ---------------------------------------------------------------- rule store

struct FakeRulesInner {
    rules: Vec<Rule>,
    due: HashMap<RuleId, i64>,
    mark: u64,
}

pub struct FakeRules {
    inner: Mutex<FakeRulesInner>,
    timeouts: Mutex<HashMap<ItemKind, String>>,
}

impl FakeRules {
    pub fn new(rules: Vec<Rule>) -> Arc<Self> {
        let due = rules.iter().map(|r| (r.druleid, 0)).collect();
        Arc::new(Self {
            inner: Mutex::new(FakeRulesInner { rules, due, mark: 1 }),
            timeouts: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_timeout(&self, kind: ItemKind, expr: &str) {
        self.timeouts.lock().unwrap().insert(kind, expr.to_string());
    }

    /// Bumps a rule's revision and makes it due immediately.
    pub fn bump_revision(&self, druleid: RuleId) {
        let mut inner = self.inner.lock().unwrap();
        for rule in inner.rules.iter_mut() {
            if rule.druleid == druleid {
                rule.revision += 1;
            }
        }
        inner.due.insert(druleid, 0);
        inner.mark += 1;
    }
}

impl RuleStore for FakeRules {
    fn rules_due(&self, now: i64) -> (Vec<Rule>, Option<i64>) {
        let inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        let mut next: Option<i64> = None;
        for rule in &inner.rules {
            let at = inner.due.get(&rule.druleid).copied().unwrap_or(0);
            if at <= now {
                due.push(rule.clone());
            } else {
                next = Some(next.map_or(at, |n: i64| n.min(at)));
            }
        }
        (due, next)
    }

    fn revisions(&self, last: u64) -> Option<(u64, Vec<(RuleId, u64)>)> {
        let inner = self.inner.lock().unwrap();
        if inner.mark == last {
            return None;
        }
        let pairs = inner.rules.iter().map(|r| (r.druleid, r.revision)).collect();
        Some((inner.mark, pairs))
    }

    fn requeue(&self, now: i64, druleid: RuleId, delay_sec: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.due.insert(druleid, now + delay_sec as i64);
    }

    fn global_item_timeout(&self, kind: ItemKind) -> String {
        self.timeouts
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| "3s".to_string())
    }

    fn resolve_macros(&self, text: &str) -> String {
        text.to_string()
    }
}

// ----------------------------------------------------------- discovery store

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRow {
    pub druleid: RuleId,
    pub dcheckid: u64,
    pub unique_dcheckid: u64,
    pub ip: String,
    pub dns: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRow {
    pub druleid: RuleId,
    pub ip: String,
    pub dns: String,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRow {
    pub druleid: RuleId,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct StoreState {
    pub services: Vec<ServiceRow>,
    pub hosts: Vec<HostRow>,
    pub rules: Vec<RuleRow>,
    pub down_marked: Vec<(u64, Vec<u64>)>,
    dhosts: HashMap<(RuleId, String), u64>,
    next_dhostid: u64,
    next_dserviceid: u64,
}

#[derive(Debug, Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn hosts_for(&self, druleid: RuleId) -> Vec<HostRow> {
        self.state()
            .hosts
            .iter()
            .filter(|h| h.druleid == druleid)
            .cloned()
            .collect()
    }

    pub fn services_for(&self, druleid: RuleId) -> Vec<ServiceRow> {
        self.state()
            .services
            .iter()
            .filter(|s| s.druleid == druleid)
            .cloned()
            .collect()
    }

    pub fn rule_error(&self, druleid: RuleId) -> Option<Option<String>> {
        self.state()
            .rules
            .iter()
            .rev()
            .find(|r| r.druleid == druleid)
            .map(|r| r.error.clone())
    }
}

impl DiscoveryStore for FakeStore {
    fn open(&self) -> Box<dyn StoreHandle + '_> {
        Box::new(FakeHandle { store: self })
    }
}

struct FakeHandle<'a> {
    store: &'a FakeStore,
}

impl StoreHandle for FakeHandle<'_> {
    fn update_service(
        &mut self,
        druleid: RuleId,
        dcheckid: u64,
        unique_dcheckid: u64,
        dhost: &mut DbHost,
        ip: &str,
        dns: &str,
        port: u16,
        status: ServiceStatus,
        value: &str,
        _clock: i64,
        dserviceids: &mut Vec<u64>,
        _events: &dyn EventSink,
    ) {
        let mut state = self.store.state();
        if dhost.dhostid == 0 {
            let key = (druleid, ip.to_string());
            let next = state.next_dhostid + 1;
            let id = *state.dhosts.entry(key).or_insert(next);
            state.next_dhostid = state.next_dhostid.max(id);
            dhost.dhostid = id;
        }
        state.next_dserviceid += 1;
        dserviceids.push(state.next_dserviceid);
        state.services.push(ServiceRow {
            druleid,
            dcheckid,
            unique_dcheckid,
            ip: ip.to_string(),
            dns: dns.to_string(),
            port,
            status,
            value: value.to_string(),
        });
    }

    fn update_service_down(&mut self, dhostid: u64, _clock: i64, dserviceids: &[u64]) {
        self.store
            .state()
            .down_marked
            .push((dhostid, dserviceids.to_vec()));
    }

    fn update_host(
        &mut self,
        druleid: RuleId,
        dhost: &mut DbHost,
        ip: &str,
        dns: &str,
        status: ServiceStatus,
        clock: i64,
        events: &dyn EventSink,
    ) {
        self.store.state().hosts.push(HostRow {
            druleid,
            ip: ip.to_string(),
            dns: dns.to_string(),
            status,
        });
        events.add_event(DiscoveryEvent {
            druleid,
            object: EventObject::Host { dhostid: dhost.dhostid },
            ip: ip.to_string(),
            dns: dns.to_string(),
            status,
            clock,
        });
    }

    fn update_rule(&mut self, druleid: RuleId, error: Option<&str>, _clock: i64) {
        self.store.state().rules.push(RuleRow {
            druleid,
            error: error.map(str::to_string),
        });
    }

    fn find_host(&mut self, druleid: RuleId, ip: &str, dhost: &mut DbHost) {
        let state = self.store.state();
        if let Some(id) = state.dhosts.get(&(druleid, ip.to_string())) {
            dhost.dhostid = *id;
        }
    }
}

// ------------------------------------------------------------------- events

#[derive(Debug, Default)]
pub struct FakeEvents {
    pub events: Mutex<Vec<DiscoveryEvent>>,
    pub processed: AtomicUsize,
}

impl FakeEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn host_events(&self) -> Vec<DiscoveryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for FakeEvents {
    fn add_event(&self, event: DiscoveryEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn process_events(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

// ------------------------------------------------------------------ drivers

/// Ping driver answering for a fixed set of addresses.
pub struct FakePinger {
    alive: HashSet<IpAddr>,
}

impl FakePinger {
    pub fn new<I: IntoIterator<Item = IpAddr>>(alive: I) -> Arc<Self> {
        Arc::new(Self { alive: alive.into_iter().collect() })
    }
}

impl Pinger for FakePinger {
    fn ping_batch<'a>(
        &'a self,
        targets: &'a [IpAddr],
        _retries: u32,
        _timeout: Duration,
        _allow_redirect: bool,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PingReply>>> {
        async move {
            Ok(targets
                .iter()
                .map(|addr| PingReply {
                    addr: *addr,
                    received: self.alive.contains(addr),
                    dnsname: None,
                })
                .collect())
        }
        .boxed()
    }
}

/// SNMP driver that answers for fixed addresses, stalls for a configurable
/// time and records how many GETs ever ran concurrently.
pub struct FakeSnmp {
    up: HashMap<IpAddr, String>,
    delay: Duration,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub cache_reloads: AtomicUsize,
}

impl FakeSnmp {
    pub fn new<I: IntoIterator<Item = (IpAddr, String)>>(up: I, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            up: up.into_iter().collect(),
            delay,
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            cache_reloads: AtomicUsize::new(0),
        })
    }
}

impl SnmpDriver for FakeSnmp {
    fn get<'a>(
        &'a self,
        _check: &'a Check,
        ip: IpAddr,
        _port: u16,
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        async move {
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.up.get(&ip).cloned())
        }
        .boxed()
    }

    fn reload_cache(&self) {
        self.cache_reloads.fetch_add(1, Ordering::Relaxed);
    }
}

/// Deterministic reverse resolver: every address resolves.
pub struct FakeResolver;

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ReverseResolver for FakeResolver {
    fn reverse(&self, ip: IpAddr) -> BoxFuture<'_, Option<String>> {
        async move { Some(format!("host-{}.lab", ip.to_string().replace([':', '.'], "-"))) }.boxed()
    }
}

// ------------------------------------------------------------------ helpers

/// Polls `cond` until it holds or the timeout elapses.
pub async fn wait_for<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
