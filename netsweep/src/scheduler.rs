//! The rule scheduler: one actor loop per engine.
//!
//! Every cycle it diffs rule revisions (purging stale jobs), drains
//! completed results, expands due rules into jobs on the queue and then
//! sleeps until the soonest due time — capped by the base tick, skipped
//! entirely while the drainer still has a backlog, and cut short by control
//! messages from the IPC surface.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::drain;
use crate::error::EngineError;
use crate::job;
use crate::probe::SnmpDriver;
use crate::queue::JobQueue;
use crate::results::ResultsCache;
use crate::rule::{parse_time_suffix, validate_item_timeout, Check, Rule, RuleId};
use crate::store::{DiscoveryStore, EventSink, ItemKind, RuleStore};
use crate::unix_time;
use crate::usage::UsageTracker;

/// Control messages fed from the IPC surface into the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMsg {
    SnmpCacheReload,
    Shutdown,
}

pub(crate) struct Scheduler {
    pub cfg: EngineConfig,
    pub queue: Arc<JobQueue>,
    pub results: Arc<ResultsCache>,
    pub usage: Arc<UsageTracker>,
    pub rules: Arc<dyn RuleStore>,
    pub store: Arc<dyn DiscoveryStore>,
    pub events: Arc<dyn EventSink>,
    pub snmp: Arc<dyn SnmpDriver>,
    pub ctrl_rx: mpsc::Receiver<ControlMsg>,
    pub stop: Arc<AtomicBool>,
}

/// Global per-class timeouts resolved at most once per cycle.
#[derive(Default)]
struct TimeoutCache {
    resolved: HashMap<ItemKind, Result<Duration, String>>,
}

impl TimeoutCache {
    fn get(&mut self, rules: &dyn RuleStore, kind: ItemKind) -> Result<Duration, String> {
        self.resolved
            .entry(kind)
            .or_insert_with(|| {
                let raw = rules.global_item_timeout(kind);
                let resolved = rules.resolve_macros(&raw);
                validate_item_timeout(&resolved)
            })
            .clone()
    }
}

fn timeout_class(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Agent => "agent",
        ItemKind::Snmp => "SNMP",
        ItemKind::Simple => "simple",
    }
}

impl Scheduler {
    #[instrument(name = "scheduler", skip_all)]
    pub async fn run(mut self) {
        info!(workers = self.cfg.workers, "discovery scheduler started");

        let mut nextcheck: Option<i64> = None;
        let mut revision_mark = 0u64;
        let mut incomplete: HashSet<RuleId> = HashSet::new();
        let mut rule_errors: Vec<(RuleId, String)> = Vec::new();

        loop {
            // stale revisions: drop the queued work, remember the rules so
            // the drain pass discards their cached results
            let mut deleted: Vec<RuleId> = Vec::new();
            if let Some((mark, revisions)) = self.rules.revisions(revision_mark) {
                revision_mark = mark;
                let current: HashMap<RuleId, u64> = revisions.into_iter().collect();
                let mut q = self.queue.lock();
                for druleid in q.job_ids() {
                    let revision = q.job(druleid).map(|job| job.revision);
                    if current.get(&druleid).copied() != revision {
                        q.purge_job_tasks(druleid);
                        deleted.push(druleid);
                        debug!(druleid, "rule revision changed, job purged");
                    }
                }
                nextcheck = None;
            }
            rule_errors.extend(self.queue.lock().take_errors());
            deleted.sort_unstable();

            let drained = drain::process_results(
                &self.results,
                &*self.store,
                &*self.events,
                &deleted,
                &mut incomplete,
                &mut rule_errors,
                self.cfg.batch_results,
            );

            let now = unix_time();
            if nextcheck.map_or(true, |due| now >= due) {
                nextcheck = self.process_discovery(now, &incomplete, &mut rule_errors);
            }

            {
                let q = self.queue.lock();
                debug!(
                    jobs = q.jobs_len(),
                    queue_used_pct =
                        100.0 * q.pending_checks as f64 / self.cfg.queue_max as f64,
                    unsaved = drained.total_services - drained.drained_services,
                    "cycle complete"
                );
            }
            self.usage.collect();

            let sleep = if drained.more {
                Duration::ZERO
            } else {
                sleep_until_due(nextcheck, unix_time(), self.cfg.delay_tick)
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                msg = self.ctrl_rx.recv() => match msg {
                    Some(ControlMsg::SnmpCacheReload) => {
                        debug!("reloading SNMP cache");
                        self.snmp.reload_cache();
                    }
                    Some(ControlMsg::Shutdown) | None => break,
                },
            }
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
        }

        // make sure the workers die with the scheduler even when the owner
        // never reaps the engine
        self.stop.store(true, Ordering::Relaxed);
        self.queue.stop();
        info!("discovery scheduler stopped");
    }

    /// Expands due rules into queued jobs; returns the soonest future due
    /// time reported by the rule store.
    fn process_discovery(
        &self,
        now: i64,
        incomplete: &HashSet<RuleId>,
        rule_errors: &mut Vec<(RuleId, String)>,
    ) -> Option<i64> {
        let (due, nextcheck) = self.rules.rules_due(now);
        if due.is_empty() {
            return nextcheck;
        }

        let mut timeouts = TimeoutCache::default();
        let mut jobs = Vec::new();
        let mut counts: Vec<((RuleId, String), u64)> = Vec::new();
        let mut err_rules: Vec<RuleId> = Vec::new();
        let mut queued_local: u64 = 0;
        let default_delay = self.cfg.default_interval.as_secs();

        for rule in due {
            let now = unix_time();

            let delay_expr = self.rules.resolve_macros(&rule.delay);
            let Some(delay) = parse_time_suffix(&delay_expr) else {
                let err = EngineError::RuleConfig {
                    rule: rule.name.clone(),
                    reason: format!("invalid update interval \"{delay_expr}\""),
                };
                warn!(druleid = rule.druleid, "{err}");
                rule_errors.push((rule.druleid, err.to_string()));
                err_rules.push(rule.druleid);
                self.rules.requeue(now, rule.druleid, default_delay);
                continue;
            };

            if incomplete.contains(&rule.druleid) || self.queue.lock().contains_job(rule.druleid) {
                self.rules.requeue(now, rule.druleid, delay);
                continue;
            }

            match self.expand_rule(&rule, &mut timeouts, queued_local) {
                Ok(Some(mut expansion)) => {
                    queued_local += expansion.total_checks;
                    counts.append(&mut expansion.counts);
                    let unique = rule.unique_check_id();
                    jobs.push(expansion.into_job(&rule, unique));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(druleid = rule.druleid, "{err}");
                    rule_errors.push((rule.druleid, err.to_string()));
                    err_rules.push(rule.druleid);
                }
            }
            self.rules.requeue(now, rule.druleid, delay);
        }

        for druleid in &err_rules {
            self.results.register_sentinel(*druleid);
        }

        if !jobs.is_empty() {
            debug!(jobs = jobs.len(), checks = queued_local, "queueing expanded rules");
            self.results.add_outstanding(counts);
            let mut q = self.queue.lock();
            q.pending_checks += queued_local;
            for job in jobs {
                q.push_job(job);
            }
            drop(q);
            self.queue.notify_all();
        }

        nextcheck
    }

    /// Resolves check timeouts and expands one rule within the queue
    /// capacity left this cycle.
    fn expand_rule(
        &self,
        rule: &Rule,
        timeouts: &mut TimeoutCache,
        queued_local: u64,
    ) -> Result<Option<job::Expansion>, EngineError> {
        let mut checks: Vec<Check> = Vec::with_capacity(rule.checks.len());
        for check in &rule.checks {
            let kind = check.kind.timeout_kind();
            match timeouts.get(&*self.rules, kind) {
                Ok(timeout) => {
                    let mut check = check.clone();
                    check.timeout = timeout;
                    checks.push(check);
                }
                Err(reason) => {
                    return Err(EngineError::RuleConfig {
                        rule: rule.name.clone(),
                        reason: format!(
                            "invalid global timeout for {} checks: {reason}",
                            timeout_class(kind)
                        ),
                    });
                }
            }
        }

        let capacity = self
            .cfg
            .queue_max
            .saturating_sub(self.queue.pending_checks())
            .saturating_sub(queued_local);
        job::expand(rule, checks, capacity)
    }
}

fn sleep_until_due(nextcheck: Option<i64>, now: i64, tick: Duration) -> Duration {
    match nextcheck {
        None => tick,
        Some(due) => Duration::from_secs(due.saturating_sub(now).max(0) as u64).min(tick),
    }
}
