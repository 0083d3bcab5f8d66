//! Applying worker events: progress, processing, and the final outcome.

use tokio::time::Instant;

use crate::error::{GateError, GateResult};
use crate::fetch::FetchError;
use crate::job_queue::{JobId, JobStatus, TransitionFields};
use crate::retry::RetryDecision;
use crate::worker::{WorkerEvent, WorkerOutput};

use super::Scheduler;

impl Scheduler {
    /// Apply one worker event to the queue and the reservation layers.
    ///
    /// A job that is no longer active when its worker reports (cancelled) gets
    /// its worker aborted; nothing is written over the terminal state.
    pub async fn handle_event(&mut self, event: WorkerEvent) -> GateResult<()> {
        match event {
            WorkerEvent::Progress {
                job_id,
                percent,
                stage,
            } => {
                let active = self
                    .state
                    .queue
                    .update_progress(job_id, percent, stage.as_deref())
                    .await?;
                if !active && self.state.control.request_abort(job_id) {
                    tracing::info!(job_id, "job no longer active, aborting worker");
                }
            }
            WorkerEvent::Processing { job_id, stage } => {
                match self
                    .state
                    .queue
                    .transition(job_id, JobStatus::Processing, TransitionFields::stage(stage))
                    .await
                {
                    Ok(_) => {}
                    Err(GateError::InvalidTransition { from, .. }) => {
                        tracing::info!(job_id, %from, "job left downloading, aborting worker");
                        self.state.control.request_abort(job_id);
                    }
                    Err(e) => return Err(e),
                }
            }
            WorkerEvent::Finished { job_id, result } => self.finish(job_id, result).await?,
        }
        Ok(())
    }

    /// Release the job's reservations, then settle its status.
    async fn finish(
        &mut self,
        job_id: JobId,
        result: Result<WorkerOutput, FetchError>,
    ) -> GateResult<()> {
        let Some(run) = self.running.remove(&job_id) else {
            tracing::warn!(job_id, "finish reported for a job that is not running");
            return Ok(());
        };
        self.state.control.unregister(job_id);
        self.release_slot(&run.slot);
        self.state.admission.release(&run.user_id);

        match result {
            Ok(output) => {
                self.report_proxy(&run.proxy_id, true);
                let fields = TransitionFields {
                    stage: Some("completed".to_string()),
                    file_url: Some(output.file_url),
                    thumbnail_url: output.thumbnail_url,
                    duration_secs: output.duration_secs,
                    processing_time_ms: Some(output.processing_time_ms),
                    ..TransitionFields::default()
                };
                match self
                    .state
                    .queue
                    .transition(job_id, JobStatus::Completed, fields)
                    .await
                {
                    Ok(job) => tracing::info!(
                        job_id,
                        attempt = run.attempt,
                        processing_time_ms = ?job.processing_time_ms,
                        "job completed"
                    ),
                    Err(GateError::InvalidTransition { from, .. }) => {
                        tracing::info!(job_id, %from, "output discarded, job was cancelled")
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(FetchError::Cancelled) => {
                // Whoever cancelled already settled the status (or shutdown leaves
                // it for recovery). The proxy did nothing wrong.
                if let Err(e) = self.state.proxies.release(&run.proxy_id) {
                    tracing::warn!(proxy_id = %run.proxy_id, "proxy release failed: {}", e);
                }
                tracing::info!(job_id, "worker stopped after cancel");
            }
            Err(FetchError::Permanent(message)) => {
                // The proxy delivered a definitive answer.
                self.report_proxy(&run.proxy_id, true);
                self.fail(job_id, &GateError::PermanentFetch(message).to_string())
                    .await?;
            }
            Err(FetchError::Transient { kind, message }) => {
                self.report_proxy(&run.proxy_id, false);
                let error = GateError::TransientFetch(format!("{}: {}", kind.as_str(), message))
                    .to_string();
                match self.settings.retry.decide(run.attempt, kind) {
                    RetryDecision::RetryAfter(delay) => {
                        match self.state.queue.requeue(job_id, &error).await {
                            Ok(_) => {
                                self.backoff.retry_after(job_id, Instant::now(), delay);
                                tracing::info!(
                                    job_id,
                                    attempt = run.attempt,
                                    retry_in_ms = delay.as_millis() as u64,
                                    "{}",
                                    error
                                );
                            }
                            Err(GateError::InvalidTransition { from, .. }) => {
                                tracing::info!(job_id, %from, "not retrying, job was cancelled")
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    RetryDecision::NoRetry => {
                        tracing::warn!(job_id, attempt = run.attempt, "giving up: {}", error);
                        self.fail(job_id, &error).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move an active job to `failed`; a job that is already terminal is left alone.
    async fn fail(&self, job_id: JobId, error: &str) -> GateResult<()> {
        match self
            .state
            .queue
            .transition(job_id, JobStatus::Failed, TransitionFields::error(error))
            .await
        {
            Ok(_) => {
                tracing::warn!(job_id, "job failed: {}", error);
                Ok(())
            }
            Err(GateError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id, %from, "job already settled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
