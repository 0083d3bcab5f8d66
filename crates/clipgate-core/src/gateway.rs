//! Submission and query facade.
//!
//! `Gateway` owns the shared admission state (queue, user quotas, platform
//! slots, proxies, abort registry) and is what the CLI talks to. The
//! scheduler borrows the same state through [`GateState`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::admission::{UserAdmission, UserLimits};
use crate::config::GateConfig;
use crate::control::JobControl;
use crate::error::GateResult;
use crate::job_queue::{
    unix_timestamp, DownloadJob, JobId, JobQueue, JobStatus, NewJob, TransitionFields,
};
use crate::platform::Platform;
use crate::proxy_pool::{ProxyPolicy, ProxyPool};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::slots::PlatformSlots;
use crate::stats::{StatsReporter, SystemStats};
use crate::worker::{Collaborators, WorkerSettings};

/// Error recorded on a job cancelled by request.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Components shared between the gateway and the scheduler.
#[derive(Debug, Clone)]
pub struct GateState {
    pub queue: JobQueue,
    pub admission: Arc<UserAdmission>,
    pub slots: Arc<PlatformSlots>,
    pub proxies: Arc<ProxyPool>,
    pub control: Arc<JobControl>,
}

impl GateState {
    pub fn from_config(cfg: &GateConfig, queue: JobQueue) -> Self {
        Self {
            queue,
            admission: Arc::new(UserAdmission::new(UserLimits::from(&cfg.users))),
            slots: Arc::new(PlatformSlots::new(&cfg.platforms)),
            proxies: Arc::new(ProxyPool::from_config(
                ProxyPolicy::from(&cfg.proxy_policy),
                &cfg.proxies,
            )),
            control: Arc::new(JobControl::new()),
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobStatus,
    /// An identical job (same user and URL) was already in flight; its id is returned.
    pub duplicate: bool,
}

pub struct Gateway {
    state: GateState,
    stats: StatsReporter,
}

impl Gateway {
    pub fn new(cfg: &GateConfig, queue: JobQueue) -> Self {
        Self::from_state(GateState::from_config(cfg, queue))
    }

    pub fn from_state(state: GateState) -> Self {
        let stats = StatsReporter::new(
            state.queue.clone(),
            Arc::clone(&state.slots),
            Arc::clone(&state.proxies),
            Arc::clone(&state.admission),
        );
        Self { state, stats }
    }

    /// Gateway over the default on-disk queue.
    pub async fn open(cfg: &GateConfig) -> anyhow::Result<Self> {
        let queue = JobQueue::open_default()
            .await
            .context("open job queue")?;
        Ok(Self::new(cfg, queue))
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn queue(&self) -> &JobQueue {
        &self.state.queue
    }

    pub fn stats_reporter(&self) -> StatsReporter {
        self.stats.clone()
    }

    /// Accept a URL for download.
    ///
    /// Resubmitting a URL the user already has in flight returns the existing
    /// job and is not charged against the rate limit. Admission to a worker
    /// happens later, in the scheduler; this never waits.
    pub async fn submit(
        &self,
        user_id: &str,
        url: &str,
        with_subtitles: bool,
    ) -> GateResult<Submission> {
        let platform = Platform::from_url(url)?;
        let source_url = url.trim();

        if let Some(existing) = self.state.queue.find_in_flight(user_id, source_url).await? {
            tracing::debug!(job_id = existing.id, user_id, "duplicate submission");
            return Ok(Submission {
                job_id: existing.id,
                status: existing.status,
                duplicate: true,
            });
        }

        self.restore_rate_windows(Some(user_id)).await?;
        self.state.admission.try_register_request(user_id)?;
        let enqueued = self
            .state
            .queue
            .enqueue(&NewJob {
                user_id: user_id.to_string(),
                source_url: source_url.to_string(),
                platform,
                with_subtitles,
            })
            .await?;
        if enqueued.created {
            tracing::info!(job_id = enqueued.id, user_id, %platform, with_subtitles, "job submitted");
        }
        Ok(Submission {
            job_id: enqueued.id,
            status: enqueued.status,
            duplicate: !enqueued.created,
        })
    }

    pub async fn status(&self, job_id: JobId) -> GateResult<DownloadJob> {
        self.state.queue.get_status(job_id).await
    }

    /// Jobs newest first, optionally only those in `status`.
    pub async fn list(&self, status: Option<JobStatus>) -> GateResult<Vec<DownloadJob>> {
        match status {
            Some(status) => self.state.queue.list_by_status(status).await,
            None => self.state.queue.list_jobs().await,
        }
    }

    pub async fn system_stats(&self) -> GateResult<SystemStats> {
        self.restore_rate_windows(None).await?;
        self.stats.snapshot().await
    }

    /// Rebuild the rate windows of users this process has not seen yet (just
    /// `user_id`, or everyone) from the jobs they created recently. Each CLI
    /// invocation is a new process, so the queue is what carries the window.
    async fn restore_rate_windows(&self, user_id: Option<&str>) -> GateResult<()> {
        let admission = &self.state.admission;
        if user_id.is_some_and(|u| admission.is_tracked(u)) {
            return Ok(());
        }
        let window = admission.limits().window;
        let window_secs = window.as_secs_f64().ceil() as i64;
        let now = unix_timestamp();
        let recent = self
            .state
            .queue
            .submissions_since(now - window_secs, user_id)
            .await?;
        for r in recent {
            let age = Duration::from_secs(u64::try_from(now - r.oldest_at).unwrap_or(0));
            admission.restore_window(&r.user_id, r.count, age);
        }
        Ok(())
    }

    /// Fail a job that has not finished yet and abort its worker if one is running here.
    ///
    /// The worker's reservations are released when it reports back.
    pub async fn cancel(&self, job_id: JobId) -> GateResult<DownloadJob> {
        let job = self
            .state
            .queue
            .transition(job_id, JobStatus::Failed, TransitionFields::error(CANCELLED_ERROR))
            .await?;
        if self.state.control.request_abort(job_id) {
            tracing::info!(job_id, "abort requested");
        }
        tracing::info!(job_id, "job cancelled");
        Ok(job)
    }

    /// A scheduler over this gateway's state.
    pub fn scheduler(
        &self,
        collaborators: Collaborators,
        worker_settings: WorkerSettings,
        settings: SchedulerSettings,
    ) -> Scheduler {
        Scheduler::new(self.state.clone(), collaborators, worker_settings, settings)
    }
}
