//! Admission pass: reserve, transition, hand off to a worker.

use std::collections::HashSet;

use tokio::time::Instant;

use crate::error::{GateError, GateResult};
use crate::job_queue::{DownloadJob, JobId, JobStatus, TransitionFields};
use crate::proxy_pool::ProxyLease;
use crate::slots::SlotToken;
use crate::worker::{WorkerPermit, WorkerTask};

use super::{RunningJob, Scheduler, TickSummary};

/// Everything an admitted job holds before its worker starts.
struct Grant {
    slot: SlotToken,
    proxy: ProxyLease,
}

impl Scheduler {
    /// One admission pass over the pending queue, oldest job first.
    ///
    /// Stops early when no worker capacity is left; jobs after that point are
    /// neither admitted nor counted as deferred.
    pub async fn tick(&mut self) -> GateResult<TickSummary> {
        let pending = self.state.queue.list_by_status(JobStatus::Pending).await?;
        let ids: HashSet<_> = pending.iter().map(|j| j.id).collect();
        self.backoff.retain(&ids);

        let mut summary = TickSummary::default();
        let now = Instant::now();
        for job in pending {
            if self.backoff.is_waiting(job.id, now) {
                continue;
            }
            let Some(permit) = self.workers.try_reserve() else {
                tracing::trace!("all workers busy");
                break;
            };
            match self.try_admit(&job) {
                Ok(grant) => {
                    if self.dispatch(job, grant, permit).await? {
                        summary.dispatched += 1;
                    }
                }
                Err(denied) => {
                    drop(permit);
                    if self.defer(&job, &denied, now).await? {
                        summary.expired += 1;
                    } else {
                        summary.deferred += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// user → slot → proxy. Each failure undoes what was already taken.
    fn try_admit(&self, job: &DownloadJob) -> Result<Grant, GateError> {
        let state = &self.state;
        state.admission.try_admit_user(&job.user_id)?;

        let Some(slot) = state.slots.try_acquire(job.platform) else {
            state.admission.release(&job.user_id);
            return Err(GateError::SlotUnavailable(job.platform));
        };

        // A retried job prefers a different egress than the one that just failed.
        let Some(proxy) = state.proxies.try_assign_avoiding(job.last_proxy_id.as_deref()) else {
            self.release_slot(&slot);
            state.admission.release(&job.user_id);
            return Err(GateError::ProxyUnavailable);
        };

        Ok(Grant { slot, proxy })
    }

    fn rollback(&self, user_id: &str, grant: Grant) {
        if let Err(e) = self.state.proxies.release(&grant.proxy.id) {
            tracing::warn!(proxy_id = %grant.proxy.id, "proxy release failed: {}", e);
        }
        self.release_slot(&grant.slot);
        self.state.admission.release(user_id);
    }

    /// Record a denial. Returns true when the job ran out of admission time and was failed.
    async fn defer(&mut self, job: &DownloadJob, denied: &GateError, now: Instant) -> GateResult<bool> {
        // Waiting on the user's own running jobs is not starvation.
        let starved = !matches!(denied, GateError::ConcurrencyExceeded { .. });
        let waited = self.backoff.defer(
            job.id,
            now,
            self.settings.poll_interval,
            self.settings.admission_backoff_max,
            starved,
        );
        let Some(waited) = waited.filter(|w| *w > self.settings.max_admission_wait) else {
            tracing::debug!(job_id = job.id, user_id = %job.user_id, "admission deferred: {}", denied);
            return Ok(false);
        };

        self.backoff.clear(job.id);
        let error = GateError::AdmissionTimeout { waited }.to_string();
        match self
            .state
            .queue
            .transition(job.id, JobStatus::Failed, TransitionFields::error(&error))
            .await
        {
            Ok(_) => {
                tracing::warn!(job_id = job.id, last_denial = %denied, "{}", error);
                Ok(true)
            }
            // Cancelled since the pending list was read.
            Err(GateError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// pending → admitted → downloading, then spawn the worker.
    ///
    /// Returns false if the job left `pending` underneath us; its reservations
    /// are rolled back in that case.
    async fn dispatch(
        &mut self,
        job: DownloadJob,
        grant: Grant,
        permit: WorkerPermit,
    ) -> GateResult<bool> {
        let job_id = job.id;
        let started = async {
            let queue = &self.state.queue;
            queue
                .transition(job_id, JobStatus::Admitted, TransitionFields::default())
                .await?;
            let attempt = queue.record_dispatch(job_id, &grant.proxy.id).await?;
            let job = queue
                .transition(
                    job_id,
                    JobStatus::Downloading,
                    TransitionFields::stage("downloading"),
                )
                .await?;
            Ok::<_, GateError>((job, attempt))
        }
        .await;

        let (job, attempt) = match started {
            Ok(started) => started,
            Err(e) => {
                self.rollback(&job.user_id, grant);
                return self.abandon_dispatch(job_id, e).await;
            }
        };

        let abort = self.state.control.register(job_id);
        tracing::info!(
            job_id,
            user_id = %job.user_id,
            platform = %job.platform,
            proxy_id = %grant.proxy.id,
            attempt,
            "job dispatched"
        );
        self.running.insert(
            job_id,
            RunningJob {
                user_id: job.user_id.clone(),
                slot: grant.slot,
                proxy_id: grant.proxy.id.clone(),
                attempt,
            },
        );
        self.workers.spawn(
            permit,
            WorkerTask {
                job,
                proxy: grant.proxy,
                attempt,
                abort,
            },
        );
        Ok(true)
    }

    /// Put a half-dispatched job back to `pending` if it got as far as `admitted`.
    async fn abandon_dispatch(&self, job_id: JobId, cause: GateError) -> GateResult<bool> {
        let queue = &self.state.queue;
        if let Ok(current) = queue.get_status(job_id).await {
            if current.status.is_active() {
                if let Err(e) = queue.requeue(job_id, &cause.to_string()).await {
                    tracing::error!(job_id, "could not requeue after failed dispatch: {}", e);
                }
            }
        }
        match cause {
            GateError::InvalidTransition { .. } | GateError::JobNotFound(_) => {
                tracing::debug!(job_id, "job left pending before dispatch: {}", cause);
                Ok(false)
            }
            other => Err(other),
        }
    }
}
