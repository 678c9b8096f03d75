//! The result drainer: completed partials become persisted hosts, services
//! and events.
//!
//! Runs once per scheduler cycle.  Ready partials are moved out of the cache
//! under its lock, then emitted with no lock held.  The empty-IP sentinel is
//! translated into a rule-state update, consuming the rule's pending error
//! string when one exists.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::results::{DrainBatch, Partial, ResultsCache};
use crate::rule::{RuleId, ServiceStatus};
use crate::store::{DbHost, DiscoveryStore, EventSink, StoreHandle};

/// What one drain pass accomplished; `more` asks the scheduler to skip its
/// sleep because the batch budget was exhausted.
#[derive(Debug, Default)]
pub(crate) struct DrainOutcome {
    pub more: bool,
    pub total_services: u64,
    pub drained_services: u64,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn process_results(
    cache: &ResultsCache,
    store: &dyn DiscoveryStore,
    events: &dyn EventSink,
    deleted: &[RuleId],
    incomplete: &mut HashSet<RuleId>,
    rule_errors: &mut Vec<(RuleId, String)>,
    batch: u64,
) -> DrainOutcome {
    incomplete.clear();
    cache.purge_outstanding(deleted);

    let errored: Vec<RuleId> = rule_errors.iter().map(|(rule, _)| *rule).collect();
    let DrainBatch { ready, total_services, drained_services } =
        cache.drain_ready(deleted, &errored, batch, incomplete);

    debug!(
        ready = ready.len(),
        drained_services,
        total_services,
        deleted = deleted.len(),
        incomplete = incomplete.len(),
        "drain pass"
    );

    if !ready.is_empty() {
        let mut handle = store.open();
        for partial in ready {
            emit(handle.as_mut(), events, partial, rule_errors);
        }
    }

    DrainOutcome {
        more: drained_services >= batch,
        total_services,
        drained_services,
    }
}

fn emit(
    handle: &mut dyn StoreHandle,
    events: &dyn EventSink,
    partial: Partial,
    rule_errors: &mut Vec<(RuleId, String)>,
) {
    if partial.ip.is_empty() {
        // rule-level sentinel: record the pass, consuming any pending error
        let error = rule_errors
            .iter()
            .position(|(rule, _)| *rule == partial.druleid)
            .map(|idx| rule_errors.remove(idx).1);
        handle.update_rule(partial.druleid, error.as_deref(), partial.clock);
        return;
    }

    let Some(ref dnsname) = partial.dnsname else {
        warn!(
            druleid = partial.druleid,
            ip = %partial.ip,
            "missing DNS name, result skipped"
        );
        return;
    };

    let mut dhost = DbHost::default();
    let host_status = process_services(handle, events, &partial, &mut dhost, dnsname);
    handle.update_host(
        partial.druleid,
        &mut dhost,
        &partial.ip,
        dnsname,
        host_status,
        partial.clock,
        events,
    );
    events.process_events();
    events.clean_events();
}

/// Persists every service of one host and derives the host status: up iff
/// at least one service is up.
fn process_services(
    handle: &mut dyn StoreHandle,
    events: &dyn EventSink,
    partial: &Partial,
    dhost: &mut DbHost,
    dnsname: &str,
) -> ServiceStatus {
    let mut host_status: Option<ServiceStatus> = None;
    let mut dserviceids = Vec::new();

    for service in &partial.services {
        if host_status != Some(ServiceStatus::Up) && host_status != Some(service.status) {
            host_status = Some(service.status);
        }
        handle.update_service(
            partial.druleid,
            service.dcheckid,
            partial.unique_dcheckid,
            dhost,
            &partial.ip,
            dnsname,
            service.port,
            service.status,
            &service.value,
            partial.clock,
            &mut dserviceids,
            events,
        );
    }

    if partial.services.is_empty() {
        handle.find_host(partial.druleid, &partial.ip, dhost);
        host_status = Some(ServiceStatus::Down);
    }

    if dhost.dhostid != 0 {
        handle.update_service_down(dhost.dhostid, partial.clock, &dserviceids);
    }

    host_status.unwrap_or(ServiceStatus::Down)
}
