//! Jobs and tasks: the worker-consumable expansion of one rule cycle.
//!
//! A job bundles every task derived from one rule in one cycle and lives in
//! the queue until its tasks drain and its last worker leaves.  A task is
//! either a single probe against one `(address, port, check)` triple or a
//! batched sweep over the rule's ranges for one check.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::iprange::{self, IpRange, RangeCursor};
use crate::rule::{Check, CheckId, CheckType, Rule, RuleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobStatus {
    /// In the queue, dispatchable.
    Queued,
    /// All allowed workers busy; re-queued when one returns.
    Waiting,
    /// No new tasks may be dispatched; deleted once the last worker leaves.
    Removing,
}

#[derive(Debug)]
pub(crate) enum TaskKind {
    /// One probe against a single address and port.
    Single {
        ip: IpAddr,
        port: u16,
        check_idx: usize,
    },
    /// Batched sweep over the rule's ranges for one non-ICMP check.
    Range {
        check_idx: usize,
        cursor: RangeCursor,
    },
    /// ICMP sweep over the union of the rule's ranges for one check.
    IcmpSweep {
        check_idx: usize,
        cursor: RangeCursor,
    },
}

#[derive(Debug)]
pub(crate) struct Task {
    pub kind: TaskKind,
    /// Weight of this task against the queue's pending-checks cap.
    pub check_count: u64,
    /// Outstanding-count decrement per address when the task commits.
    pub checks_per_ip: u64,
}

#[derive(Debug)]
pub(crate) struct Job {
    pub druleid: RuleId,
    pub revision: u64,
    pub unique_dcheckid: CheckId,
    pub checks: Arc<Vec<Check>>,
    pub ranges: Arc<Vec<IpRange>>,
    pub tasks: VecDeque<Task>,
    pub workers_used: usize,
    pub workers_max: usize,
    pub status: JobStatus,
}

impl Job {
    /// Drops every remaining task, returning the freed pending-check weight.
    pub fn clear_tasks(&mut self) -> u64 {
        let freed = self.tasks.iter().map(|t| t.check_count).sum();
        self.tasks.clear();
        freed
    }

    /// Whether dispatching the next task requires an SNMPv3 slot.
    pub fn head_needs_snmpv3(&self) -> bool {
        self.tasks
            .front()
            .map(|task| {
                let idx = match task.kind {
                    TaskKind::Single { check_idx, .. }
                    | TaskKind::Range { check_idx, .. }
                    | TaskKind::IcmpSweep { check_idx, .. } => check_idx,
                };
                self.checks
                    .get(idx)
                    .map(|c| c.kind == CheckType::SnmpV3)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

/// Everything one rule contributes to the queue in one cycle.
#[derive(Debug)]
pub(crate) struct Expansion {
    pub tasks: Vec<Task>,
    /// Per-address outstanding check counts, keyed by textual address.
    pub counts: Vec<((RuleId, String), u64)>,
    pub checks: Arc<Vec<Check>>,
    pub ranges: Arc<Vec<IpRange>>,
    pub total_checks: u64,
}

impl Expansion {
    pub fn into_job(self, rule: &Rule, unique_dcheckid: CheckId) -> Job {
        Job {
            druleid: rule.druleid,
            revision: rule.revision,
            unique_dcheckid,
            checks: self.checks,
            ranges: self.ranges,
            tasks: self.tasks.into(),
            workers_used: 0,
            workers_max: rule.concurrency,
            status: JobStatus::Queued,
        }
    }
}

/// Expands a rule into tasks and per-address check counts, refusing the
/// whole rule when the expansion would not fit into `capacity`.
///
/// `checks` carries the rule's checks with their timeouts already resolved.
/// Returns `Ok(None)` when the range list is unusable or empty — such a rule
/// produces no job and no events.
pub(crate) fn expand(
    rule: &Rule,
    checks: Vec<Check>,
    capacity: u64,
) -> Result<Option<Expansion>, EngineError> {
    let ranges = match iprange::parse_ranges(&rule.ipranges) {
        Ok(ranges) => ranges,
        Err(err) => {
            warn!(druleid = rule.druleid, "unusable IP range \"{}\": {err}", rule.ipranges);
            return Ok(None);
        }
    };
    let vol = iprange::volume(&ranges);
    if vol == 0 || checks.is_empty() {
        return Ok(None);
    }

    let per_ip: u64 = checks
        .iter()
        .map(|c| if c.kind.is_batched() { 1 } else { c.ports_count() })
        .sum();
    let total_checks = vol.saturating_mul(per_ip);
    if total_checks > capacity {
        return Err(EngineError::QueueFull);
    }

    let mut tasks = Vec::new();
    for (check_idx, check) in checks.iter().enumerate() {
        match check.kind {
            CheckType::Icmp => tasks.push(Task {
                kind: TaskKind::IcmpSweep {
                    check_idx,
                    cursor: RangeCursor::default(),
                },
                check_count: vol,
                checks_per_ip: 1,
            }),
            kind if kind.is_batched() => tasks.push(Task {
                kind: TaskKind::Range {
                    check_idx,
                    cursor: RangeCursor::default(),
                },
                check_count: vol,
                checks_per_ip: 1,
            }),
            _ => {
                let ports = check.port_ranges();
                let mut cursor = RangeCursor::default();
                while let Some(ip) = iprange::uniq_next(&ranges, &mut cursor) {
                    for (from, to) in &ports {
                        for port in *from..=*to {
                            tasks.push(Task {
                                kind: TaskKind::Single { ip, port, check_idx },
                                check_count: 1,
                                checks_per_ip: 1,
                            });
                        }
                    }
                }
            }
        }
    }

    let mut counts = Vec::with_capacity(vol as usize);
    let mut cursor = RangeCursor::default();
    while let Some(ip) = iprange::uniq_next(&ranges, &mut cursor) {
        counts.push(((rule.druleid, ip.to_string()), per_ip));
    }

    debug!(
        druleid = rule.druleid,
        tasks = tasks.len(),
        addresses = vol,
        checks = total_checks,
        "rule expanded"
    );

    Ok(Some(Expansion {
        tasks,
        counts,
        checks: Arc::new(checks),
        ranges: Arc::new(ranges),
        total_checks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(ipranges: &str, checks: Vec<Check>) -> Rule {
        Rule {
            druleid: 7,
            revision: 1,
            name: "lab".into(),
            delay: "1h".into(),
            ipranges: ipranges.into(),
            checks,
            concurrency: 0,
        }
    }

    #[test]
    fn single_checks_expand_per_address_and_port() {
        let checks = vec![Check::new(1, CheckType::Tcp).with_ports("22-23")];
        let rule = rule("10.0.0.1-3", checks.clone());
        let exp = expand(&rule, checks, 1000).unwrap().unwrap();

        assert_eq!(exp.tasks.len(), 6);
        assert_eq!(exp.total_checks, 6);
        assert!(exp
            .tasks
            .iter()
            .all(|t| matches!(t.kind, TaskKind::Single { .. }) && t.check_count == 1));
        assert_eq!(exp.counts.len(), 3);
        assert!(exp.counts.iter().all(|(_, n)| *n == 2));
    }

    #[test]
    fn batched_checks_expand_to_one_task_per_check() {
        let checks = vec![
            Check::new(1, CheckType::Icmp),
            Check::new(2, CheckType::Http).with_ports("80"),
        ];
        let rule = rule("192.168.0.0/30", checks.clone());
        let exp = expand(&rule, checks, 1000).unwrap().unwrap();

        assert_eq!(exp.tasks.len(), 2);
        assert!(matches!(exp.tasks[0].kind, TaskKind::IcmpSweep { .. }));
        assert!(matches!(exp.tasks[1].kind, TaskKind::Range { .. }));
        assert_eq!(exp.tasks[0].check_count, 4);
        assert_eq!(exp.tasks[1].check_count, 4);
        assert_eq!(exp.total_checks, 8);
        assert_eq!(exp.counts.len(), 4);
        assert!(exp.counts.iter().all(|(_, n)| *n == 2));
    }

    #[test]
    fn capacity_overflow_is_refused_whole() {
        let checks = vec![Check::new(1, CheckType::Tcp).with_ports("1-100")];
        let rule = rule("10.0.0.1-10", checks.clone());
        match expand(&rule, checks, 999) {
            Err(EngineError::QueueFull) => {}
            other => panic!("expected queue-full, got {other:?}"),
        }
    }

    #[test]
    fn unusable_ranges_yield_nothing() {
        let checks = vec![Check::new(1, CheckType::Tcp)];
        let rule = rule("not-a-range", checks.clone());
        assert!(expand(&rule, checks, 1000).unwrap().is_none());
    }

    #[test]
    fn snmpv3_head_detection() {
        let checks = vec![Check::new(1, CheckType::SnmpV3).with_ports("161")];
        let rule = rule("10.0.0.1", checks.clone());
        let exp = expand(&rule, checks, 1000).unwrap().unwrap();
        let unique = rule.unique_check_id();
        let job = exp.into_job(&rule, unique);
        assert!(job.head_needs_snmpv3());
    }
}
