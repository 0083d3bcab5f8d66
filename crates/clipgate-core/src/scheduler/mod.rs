//! Admission-controlled dispatch loop.
//!
//! Each tick walks pending jobs oldest first and admits what it can. A job
//! needs, in order: worker capacity, a free spot under its user's concurrency
//! ceiling, a platform slot and a proxy. A partial admission is rolled back in
//! reverse order. Denied jobs stay pending with a growing backoff and never
//! block the jobs behind them; a job denied for longer than
//! `max_admission_wait` fails with `AdmissionTimeout`.
//!
//! Workers report back over a channel. Every reservation taken at dispatch is
//! released when the job's `Finished` event is handled, whatever the outcome.

mod backoff;
mod dispatch;
mod finish;
mod run;


use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::GateConfig;
use crate::gateway::GateState;
use crate::job_queue::JobId;
use crate::retry::RetryPolicy;
use crate::slots::SlotToken;
use crate::stats::StatsReporter;
use crate::worker::{Collaborators, WorkerEvent, WorkerPool, WorkerSettings};

use backoff::BackoffTable;

pub use run::StatsSink;

/// Ceiling for the delay between admission attempts of one job.
const ADMISSION_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How long shutdown waits for aborted workers to report back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub max_admission_wait: Duration,
    pub admission_backoff_max: Duration,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &GateConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            max_admission_wait: cfg.max_admission_wait(),
            admission_backoff_max: ADMISSION_BACKOFF_MAX,
            shutdown_grace: SHUTDOWN_GRACE,
            retry: RetryPolicy::from(&cfg.retry_or_default()),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

/// Outcome of one admission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub deferred: usize,
    /// Jobs failed with `AdmissionTimeout` during this pass.
    pub expired: usize,
}

/// Reservations held by a dispatched job until its worker finishes.
#[derive(Debug)]
struct RunningJob {
    user_id: String,
    slot: SlotToken,
    proxy_id: String,
    attempt: u32,
}

/// Owns the worker pool and every running job's reservations.
pub struct Scheduler {
    state: GateState,
    workers: WorkerPool,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    settings: SchedulerSettings,
    running: HashMap<JobId, RunningJob>,
    backoff: BackoffTable,
    stats: Option<(StatsReporter, StatsSink)>,
}

impl Scheduler {
    pub fn new(
        state: GateState,
        collaborators: Collaborators,
        worker_settings: WorkerSettings,
        settings: SchedulerSettings,
    ) -> Self {
        let (workers, events) = WorkerPool::new(collaborators, worker_settings);
        Self {
            state,
            workers,
            events,
            settings,
            running: HashMap::new(),
            backoff: BackoffTable::default(),
            stats: None,
        }
    }

    /// Publish a [`crate::stats::SystemStats`] snapshot to `sink` after every tick of [`Scheduler::run`].
    pub fn with_stats_sink(mut self, reporter: StatsReporter, sink: StatsSink) -> Self {
        self.stats = Some((reporter, sink));
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Jobs currently held by a worker.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running.contains_key(&job_id)
    }

    fn release_slot(&self, slot: &SlotToken) {
        if let Err(e) = self.state.slots.release(slot) {
            tracing::error!(slot_id = slot.id(), platform = %slot.platform(), "slot release failed: {}", e);
        }
    }

    fn report_proxy(&self, proxy_id: &str, success: bool) {
        if let Err(e) = self.state.proxies.report_outcome(proxy_id, success) {
            tracing::warn!(proxy_id, "proxy outcome not recorded: {}", e);
        }
    }
}
