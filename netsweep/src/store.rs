//! External collaborator interfaces.
//!
//! The engine consumes its surroundings through these narrow traits: where
//! rules come from ([`RuleStore`]), where discovered hosts and services go
//! ([`DiscoveryStore`]) and how discovery events are fanned out
//! ([`EventSink`]).  Hosts implement them over their config cache, database
//! and event pipeline; tests implement them in memory.

use crate::rule::{CheckId, Rule, RuleId, ServiceStatus};

/// Global timeout classes a check can fall under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Agent,
    Snmp,
    Simple,
}

/// Source of discovery rules and of rule scheduling state.
pub trait RuleStore: Send + Sync {
    /// Rules due at `now`, plus the soonest future due time among the rest
    /// (`None` when nothing else is scheduled).
    fn rules_due(&self, now: i64) -> (Vec<Rule>, Option<i64>);

    /// Current `(rule, revision)` pairs when anything changed since the
    /// caller's `last` sync mark; `None` when unchanged.  Returns the new
    /// sync mark alongside.
    fn revisions(&self, last: u64) -> Option<(u64, Vec<(RuleId, u64)>)>;

    /// Reschedules a rule to run `delay` seconds after `now`.
    fn requeue(&self, now: i64, druleid: RuleId, delay_sec: u64);

    /// Unresolved global timeout expression for a check class.
    fn global_item_timeout(&self, kind: ItemKind) -> String;

    /// Expands user macros in `text`.
    fn resolve_macros(&self, text: &str) -> String;
}

/// A discovered-host row being built up during one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbHost {
    pub dhostid: u64,
    pub status: Option<ServiceStatus>,
    pub lastup: i64,
    pub lastdown: i64,
}

/// Persistence sink for discovered hosts, services and rule state.
///
/// [`DiscoveryStore::open`] hands out a handle scoped to one drain pass;
/// dropping the handle closes it.
pub trait DiscoveryStore: Send + Sync {
    fn open(&self) -> Box<dyn StoreHandle + '_>;
}

#[allow(clippy::too_many_arguments)]
pub trait StoreHandle {
    /// Records one service probe result for a host, filling `dhost` with the
    /// host row it belongs to and appending the touched service id to
    /// `dserviceids`.
    fn update_service(
        &mut self,
        druleid: RuleId,
        dcheckid: CheckId,
        unique_dcheckid: CheckId,
        dhost: &mut DbHost,
        ip: &str,
        dns: &str,
        port: u16,
        status: ServiceStatus,
        value: &str,
        clock: i64,
        dserviceids: &mut Vec<u64>,
        events: &dyn EventSink,
    );

    /// Marks every service of `dhostid` not listed in `dserviceids` as down.
    fn update_service_down(&mut self, dhostid: u64, clock: i64, dserviceids: &[u64]);

    /// Records the host-level status transition.
    fn update_host(
        &mut self,
        druleid: RuleId,
        dhost: &mut DbHost,
        ip: &str,
        dns: &str,
        status: ServiceStatus,
        clock: i64,
        events: &dyn EventSink,
    );

    /// Records a completed rule pass: last clock plus its error string, or
    /// clears the error when `error` is `None`.
    fn update_rule(&mut self, druleid: RuleId, error: Option<&str>, clock: i64);

    /// Looks up an existing discovered host for `(druleid, ip)` into `dhost`.
    fn find_host(&mut self, druleid: RuleId, ip: &str, dhost: &mut DbHost);
}

/// A discovery event emitted alongside persistence updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub druleid: RuleId,
    pub object: EventObject,
    pub ip: String,
    pub dns: String,
    pub status: ServiceStatus,
    pub clock: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventObject {
    Host { dhostid: u64 },
    Service { dserviceid: u64 },
}

/// Event fan-out callbacks, invoked per host after its service and host
/// updates.  All methods default to no-ops.
pub trait EventSink: Send + Sync {
    fn add_event(&self, _event: DiscoveryEvent) {}
    fn process_events(&self) {}
    fn clean_events(&self) {}
}

/// Sink that drops all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventSink for NoopEvents {}
