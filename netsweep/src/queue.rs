//! The shared bounded job queue.
//!
//! Jobs are owned by the queue and addressed by rule id; the FIFO holds ids
//! only.  Workers block in [`JobQueue::pop`] until a dispatchable job is
//! available, take one task under the lock, and re-append the job to the
//! tail so rules interleave fairly.  The wake protocol is FIFO wake-one on
//! push and wake-all on stop.
//!
//! The single mutex also guards the pending-checks counter, the SNMPv3 slot
//! pool, staged rule errors and the live-worker count; it is never held
//! across an await point.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::iprange::IpRange;
use crate::job::{Job, JobStatus, Task};
use crate::rule::{Check, CheckId, RuleId};

/// SNMPv3 sessions are expensive to reinitialize; one engine-wide task slot.
const SNMPV3_SLOTS: u32 = 1;

#[derive(Debug)]
pub(crate) struct QueueInner {
    jobs: HashMap<RuleId, Job>,
    fifo: VecDeque<RuleId>,
    pub pending_checks: u64,
    pub snmpv3_slots: u32,
    errors: Vec<(RuleId, String)>,
    workers: usize,
    stopped: bool,
}

#[derive(Debug)]
pub(crate) struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// A dequeued job reference; the job itself stays in the map.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoppedJob {
    pub druleid: RuleId,
    /// Whether this dispatch consumed the SNMPv3 slot.
    pub snmpv3_slot: bool,
}

/// Outcome of taking the next task from a popped job.
pub(crate) enum Dispatch {
    Run(RunTask),
    /// The job had no tasks left.  When `removed`, the caller owns the
    /// completion side effects (it was dropped from the map here).
    Drained { removed: bool },
    /// The job disappeared (revision purge raced the pop).
    Gone,
}

pub(crate) struct RunTask {
    pub task: Task,
    pub unique_dcheckid: CheckId,
    pub checks: Arc<Vec<Check>>,
    pub ranges: Arc<Vec<IpRange>>,
    pub workers_max: usize,
    /// The job went back to the tail; the caller should wake one worker.
    pub requeued: bool,
}

/// What the post-probe bookkeeping decided.
#[derive(Debug, Default)]
pub(crate) struct Finish {
    pub requeued: bool,
    pub removed: bool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                fifo: VecDeque::new(),
                pending_checks: 0,
                snmpv3_slots: SNMPV3_SLOTS,
                errors: Vec::new(),
                workers: 0,
                stopped: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }

    /// Blocks until a dispatchable job is available or the queue stops.
    pub async fn pop(&self) -> Option<PoppedJob> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.stopped {
                    return None;
                }
                if let Some(popped) = inner.take_eligible() {
                    return Some(popped);
                }
            }
            notified.await;
        }
    }

    pub fn notify_one(&self) {
        self.notify.notify_one();
    }

    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// Stops the queue: poppers return `None`, all waiters wake.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.notify.notify_waiters();
    }

    pub fn register_worker(&self) {
        self.lock().workers += 1;
    }

    pub fn deregister_worker(&self) {
        let mut inner = self.lock();
        inner.workers = inner.workers.saturating_sub(1);
    }

    pub fn workers_registered(&self) -> usize {
        self.lock().workers
    }

    pub fn pending_checks(&self) -> u64 {
        self.lock().pending_checks
    }
}

impl QueueInner {
    /// Appends a job and marks it queued.
    pub fn push_job(&mut self, job: Job) {
        let druleid = job.druleid;
        self.jobs.insert(druleid, job);
        self.enqueue(druleid);
    }

    pub fn enqueue(&mut self, druleid: RuleId) {
        if let Some(job) = self.jobs.get_mut(&druleid) {
            job.status = JobStatus::Queued;
        }
        self.fifo.push_back(druleid);
    }

    pub fn job_ids(&self) -> Vec<RuleId> {
        self.jobs.keys().copied().collect()
    }

    pub fn job(&self, druleid: RuleId) -> Option<&Job> {
        self.jobs.get(&druleid)
    }

    pub fn contains_job(&self, druleid: RuleId) -> bool {
        self.jobs.contains_key(&druleid)
    }

    pub fn jobs_len(&self) -> usize {
        self.jobs.len()
    }

    pub fn push_error(&mut self, druleid: RuleId, error: String) {
        self.errors.push((druleid, error));
    }

    pub fn take_errors(&mut self) -> Vec<(RuleId, String)> {
        std::mem::take(&mut self.errors)
    }

    /// First job in FIFO order whose head task is dispatchable; SNMPv3 heads
    /// are skipped while the slot is taken.
    fn take_eligible(&mut self) -> Option<PoppedJob> {
        for idx in 0..self.fifo.len() {
            let druleid = self.fifo[idx];
            let needs_slot = self
                .jobs
                .get(&druleid)
                .map(|job| job.head_needs_snmpv3())
                .unwrap_or(false);
            if needs_slot && self.snmpv3_slots == 0 {
                continue;
            }
            self.fifo.remove(idx);
            if needs_slot {
                self.snmpv3_slots -= 1;
            }
            return Some(PoppedJob { druleid, snmpv3_slot: needs_slot });
        }
        None
    }

    /// Takes the next task of a popped job and does the dispatch-side
    /// bookkeeping: pending-checks adjustment, worker accounting, fair
    /// re-queueing or the `Waiting` transition.
    pub fn dispatch(&mut self, popped: PoppedJob) -> Dispatch {
        let druleid = popped.druleid;
        let Some(job) = self.jobs.get_mut(&druleid) else {
            if popped.snmpv3_slot {
                self.snmpv3_slots += 1;
            }
            return Dispatch::Gone;
        };

        match job.tasks.pop_front() {
            None => {
                let idle = job.workers_used == 0;
                if !idle {
                    job.status = JobStatus::Removing;
                }
                if popped.snmpv3_slot {
                    self.snmpv3_slots += 1;
                }
                if idle {
                    self.jobs.remove(&druleid);
                }
                Dispatch::Drained { removed: idle }
            }
            Some(task) => {
                job.workers_used += 1;
                let run = RunTask {
                    unique_dcheckid: job.unique_dcheckid,
                    checks: job.checks.clone(),
                    ranges: job.ranges.clone(),
                    workers_max: job.workers_max,
                    requeued: job.workers_max == 0 || job.workers_used != job.workers_max,
                    task,
                };
                if !run.requeued {
                    job.status = JobStatus::Waiting;
                }
                self.pending_checks = self.pending_checks.saturating_sub(run.task.check_count);
                if run.requeued {
                    self.fifo.push_back(druleid);
                }
                Dispatch::Run(run)
            }
        }
    }

    /// Post-probe bookkeeping: releases the worker (and SNMPv3 slot), turns
    /// an engine error into a job abort, and resolves `Waiting`/`Removing`.
    pub fn finish(
        &mut self,
        druleid: RuleId,
        release_snmpv3: bool,
        error: Option<String>,
    ) -> Finish {
        if release_snmpv3 {
            self.snmpv3_slots += 1;
        }
        let Some(job) = self.jobs.get_mut(&druleid) else {
            return Finish::default();
        };
        job.workers_used = job.workers_used.saturating_sub(1);
        let freed = if error.is_some() { job.clear_tasks() } else { 0 };
        let requeue = job.status == JobStatus::Waiting;
        let remove = job.status == JobStatus::Removing && job.workers_used == 0;
        if requeue {
            job.status = JobStatus::Queued;
        }

        self.pending_checks = self.pending_checks.saturating_sub(freed);
        if let Some(error) = error {
            self.errors.push((druleid, error));
        }
        if requeue {
            self.fifo.push_back(druleid);
        } else if remove {
            self.jobs.remove(&druleid);
        }
        Finish { requeued: requeue, removed: remove }
    }

    /// Drops the remaining tasks of a job whose rule revision changed,
    /// returning the freed pending-check weight.
    pub fn purge_job_tasks(&mut self, druleid: RuleId) -> u64 {
        let Some(job) = self.jobs.get_mut(&druleid) else {
            return 0;
        };
        let freed = job.clear_tasks();
        self.pending_checks = self.pending_checks.saturating_sub(freed);
        freed
    }
}
