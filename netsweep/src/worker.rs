//! The worker loop.
//!
//! Each worker blocks on the queue, takes one task from the popped job under
//! the lock, hands the job back to the queue tail (or parks it `Waiting`
//! when its worker cap is reached), then runs the probe with no lock held.
//! Engine errors never propagate: they abort the job, and the abort text is
//! what the drainer later persists as the rule error.  When a job's last
//! worker leaves after its last task, the worker registers the rule-level
//! sentinel so the drainer records the completed pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::job::TaskKind;
use crate::probe::{Prober, SWEEP_IN_FLIGHT_MAX};
use crate::queue::{Dispatch, JobQueue, RunTask};
use crate::results::ResultsCache;
use crate::rule::{RuleId, ServiceStatus};
use crate::usage::UsageTracker;

pub(crate) struct WorkerCtx {
    pub id: usize,
    pub queue: Arc<JobQueue>,
    pub results: Arc<ResultsCache>,
    pub usage: Arc<UsageTracker>,
    pub stop: Arc<AtomicBool>,
    pub prober: Prober,
}

pub(crate) async fn run(ctx: WorkerCtx) {
    ctx.queue.register_worker();
    debug!(worker = ctx.id, "worker started");

    while !ctx.stop.load(Ordering::Relaxed) {
        let Some(popped) = ctx.queue.pop().await else {
            break;
        };
        let druleid = popped.druleid;
        let snmpv3_slot = popped.snmpv3_slot;

        let dispatched = {
            let mut q = ctx.queue.lock();
            q.dispatch(popped)
        };
        let run = match dispatched {
            Dispatch::Run(run) => run,
            Dispatch::Drained { removed } => {
                if removed {
                    ctx.results.register_sentinel(druleid);
                }
                continue;
            }
            Dispatch::Gone => continue,
        };
        if run.requeued {
            ctx.queue.notify_one();
        }

        ctx.usage.set_busy(ctx.id);
        let outcome = run_task(&ctx, druleid, run).await;
        ctx.usage.set_idle(ctx.id);

        let error = match outcome {
            Ok(()) => None,
            Err(err) => {
                warn!(worker = ctx.id, druleid, "discovery job failed: {err}");
                Some(err.to_string())
            }
        };

        let fin = ctx.queue.lock().finish(druleid, snmpv3_slot, error);
        if fin.requeued {
            ctx.queue.notify_one();
        }
        if fin.removed {
            ctx.results.register_sentinel(druleid);
        }
    }

    ctx.queue.deregister_worker();
    debug!(worker = ctx.id, "worker stopped");
}

async fn run_task(ctx: &WorkerCtx, druleid: RuleId, run: RunTask) -> Result<(), EngineError> {
    let worker_max = if run.workers_max == 0 { SWEEP_IN_FLIGHT_MAX } else { run.workers_max };
    let RunTask { task, unique_dcheckid, checks, ranges, .. } = run;

    match task.kind {
        TaskKind::Single { ip, port, check_idx } => {
            let Some(check) = checks.get(check_idx) else {
                return Ok(());
            };
            let outcome = ctx.prober.single_check(check, ip, port).await?;
            let dnsname = match outcome.status {
                ServiceStatus::Up => ctx.prober.reverse(ip).await,
                ServiceStatus::Down => None,
            };
            if let Err(err) = ctx.results.commit_single(
                druleid,
                unique_dcheckid,
                &ip.to_string(),
                check.dcheckid,
                port,
                outcome.status,
                outcome.value,
                dnsname,
            ) {
                trace!(druleid, %ip, "{err}");
            }
        }
        TaskKind::Range { check_idx, mut cursor } => {
            let Some(check) = checks.get(check_idx) else {
                return Ok(());
            };
            let mut tail = ctx
                .prober
                .range_sweep(
                    druleid,
                    unique_dcheckid,
                    check,
                    &ranges,
                    &mut cursor,
                    worker_max,
                    &ctx.results,
                    task.checks_per_ip,
                    &ctx.stop,
                )
                .await?;
            ctx.results
                .merge_partial_range(druleid, task.checks_per_ip, &mut tail, true);
        }
        TaskKind::IcmpSweep { check_idx, mut cursor } => {
            let Some(check) = checks.get(check_idx) else {
                return Ok(());
            };
            let partials = ctx
                .prober
                .icmp_sweep(
                    druleid,
                    unique_dcheckid,
                    check,
                    &ranges,
                    &mut cursor,
                    worker_max,
                    &ctx.stop,
                )
                .await?;
            ctx.results
                .merge_full(druleid, unique_dcheckid, task.checks_per_ip, &ranges, partials);
        }
    }
    Ok(())
}
