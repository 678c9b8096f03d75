//! Engine assembly: worker pool startup, IPC bind, scheduler spawn and
//! coordinated shutdown.
//!
//! An [`Engine`] is a value, not a global — every component borrows it
//! through the shared queue and cache, so multiple instances can coexist in
//! one process (and in one test).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::dns::{ReverseResolver, SystemResolver};
use crate::error::EngineError;
use crate::ipc::IpcService;
use crate::probe::icmp::SurgePinger;
use crate::probe::{LdapDriver, NullLdap, NullSnmp, Pinger, Prober, SnmpDriver};
use crate::queue::JobQueue;
use crate::results::ResultsCache;
use crate::scheduler::{ControlMsg, Scheduler};
use crate::store::{DiscoveryStore, EventSink, NoopEvents, RuleStore};
use crate::usage::UsageTracker;
use crate::worker::{self, WorkerCtx};

/// The engine's external collaborators.  Rule source and persistence sink
/// are mandatory; everything else has a working default.
#[derive(Clone)]
pub struct Collaborators {
    pub rules: Arc<dyn RuleStore>,
    pub store: Arc<dyn DiscoveryStore>,
    pub events: Arc<dyn EventSink>,
    pub pinger: Arc<dyn Pinger>,
    pub snmp: Arc<dyn SnmpDriver>,
    pub ldap: Arc<dyn LdapDriver>,
    pub resolver: Arc<dyn ReverseResolver>,
}

impl Collaborators {
    pub fn new(rules: Arc<dyn RuleStore>, store: Arc<dyn DiscoveryStore>) -> Self {
        Self {
            rules,
            store,
            events: Arc::new(NoopEvents),
            pinger: Arc::new(SurgePinger::new()),
            snmp: Arc::new(NullSnmp),
            ldap: Arc::new(NullLdap),
            resolver: Arc::new(SystemResolver::new()),
        }
    }
}

/// A running engine instance.
pub struct Engine {
    queue: Arc<JobQueue>,
    results: Arc<ResultsCache>,
    usage: Arc<UsageTracker>,
    stop: Arc<AtomicBool>,
    workers: JoinSet<()>,
    scheduler: JoinHandle<()>,
    ipc: Option<JoinHandle<()>>,
    ctrl_tx: mpsc::Sender<ControlMsg>,
}

impl Engine {
    /// Brings up the worker pool, the IPC endpoint and the scheduler.
    /// Fails when the IPC socket cannot be bound or the workers do not
    /// register within the startup timeout.
    pub async fn start(cfg: EngineConfig, collab: Collaborators) -> Result<Self, EngineError> {
        let cfg = cfg.normalized();
        let queue = Arc::new(JobQueue::new());
        let results = Arc::new(ResultsCache::new());
        let usage = Arc::new(UsageTracker::new(cfg.workers));
        let stop = Arc::new(AtomicBool::new(false));
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);

        let ipc_service = match cfg.ipc_path.as_deref() {
            Some(path) => Some(IpcService::bind(
                path,
                queue.clone(),
                usage.clone(),
                ctrl_tx.clone(),
            )?),
            None => None,
        };

        let mut workers = JoinSet::new();
        for id in 0..cfg.workers {
            let ctx = WorkerCtx {
                id,
                queue: queue.clone(),
                results: results.clone(),
                usage: usage.clone(),
                stop: stop.clone(),
                prober: Prober::new(
                    cfg.source_ip,
                    collab.pinger.clone(),
                    collab.snmp.clone(),
                    collab.ldap.clone(),
                    collab.resolver.clone(),
                ),
            };
            workers.spawn(worker::run(ctx).instrument(debug_span!("worker", id)));
        }

        // startup handshake: every worker must check in before work flows
        let deadline = Instant::now() + cfg.startup_timeout;
        while queue.workers_registered() != cfg.workers {
            if Instant::now() >= deadline {
                stop.store(true, Ordering::Relaxed);
                queue.stop();
                while workers.join_next().await.is_some() {}
                return Err(EngineError::Startup(
                    "timeout occurred while waiting for workers to start".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let ipc = ipc_service.map(|service| tokio::spawn(service.serve()));
        let scheduler = Scheduler {
            cfg,
            queue: queue.clone(),
            results: results.clone(),
            usage: usage.clone(),
            rules: collab.rules,
            store: collab.store,
            events: collab.events,
            snmp: collab.snmp,
            ctrl_rx,
            stop: stop.clone(),
        };
        let scheduler = tokio::spawn(scheduler.run());

        Ok(Self {
            queue,
            results,
            usage,
            stop,
            workers,
            scheduler,
            ipc,
            ctrl_tx,
        })
    }

    /// Pending checks currently admitted to the queue.
    pub fn pending_checks(&self) -> u64 {
        self.queue.pending_checks()
    }

    /// Per-worker busy fractions from the last sample window.
    pub fn worker_usage(&self) -> Vec<f64> {
        self.usage.snapshot()
    }

    /// Whether the engine has no queued jobs, no pending checks and no
    /// undrained results.
    pub fn is_idle(&self) -> bool {
        self.queue.pending_checks() == 0
            && self.queue.lock().jobs_len() == 0
            && self.results.is_empty()
    }

    /// Requests shutdown and reaps every task.  In-flight probes run to
    /// completion, so the latency is bounded by the largest probe timeout.
    pub async fn shutdown(self) {
        let _ = self.ctrl_tx.send(ControlMsg::Shutdown).await;
        self.wait().await;
    }

    /// Waits for the engine to stop (scheduler exit, e.g. via the IPC
    /// shutdown request), then reaps workers and closes the IPC endpoint.
    pub async fn wait(self) {
        let Self {
            queue,
            stop,
            mut workers,
            scheduler,
            ipc,
            ctrl_tx,
            ..
        } = self;

        if let Err(err) = scheduler.await {
            warn!("scheduler task failed: {err}");
        }
        drop(ctrl_tx);
        stop.store(true, Ordering::Relaxed);
        queue.stop();
        while workers.join_next().await.is_some() {}
        if let Some(ipc) = ipc {
            ipc.abort();
            let _ = ipc.await;
        }
    }
}
