//! Job write operations: enqueue, transition, progress, requeue, recovery.

use crate::error::{GateError, GateResult};

use super::super::db::{unix_timestamp, JobQueue};
use super::super::types::{
    DownloadJob, Enqueued, JobEvent, JobId, JobStatus, NewJob, TransitionFields,
};

/// Highest progress value a job may hold before it completes.
const MAX_ACTIVE_PROGRESS: u8 = 99;

impl JobQueue {
    /// Insert a new `pending` job.
    ///
    /// If the same user already has a non-terminal job for the same URL, that
    /// job is returned (`created == false`) and nothing is inserted. The partial
    /// unique index makes this hold even for concurrent submissions.
    pub async fn enqueue(&self, job: &NewJob) -> GateResult<Enqueued> {
        // The in-flight job can finish between the ignored insert and the
        // lookup; in that case the insert is simply retried.
        for _ in 0..3 {
            let now = unix_timestamp();
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO jobs (
                    user_id, source_url, platform, with_subtitles, status,
                    progress, attempts, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, 0, ?5, ?5)
                "#,
            )
            .bind(&job.user_id)
            .bind(&job.source_url)
            .bind(job.platform.as_str())
            .bind(job.with_subtitles)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                let id = inserted.last_insert_rowid();
                tracing::debug!(job_id = id, user_id = %job.user_id, platform = %job.platform, "job enqueued");
                return Ok(Enqueued {
                    id,
                    status: JobStatus::Pending,
                    created: true,
                });
            }

            if let Some(existing) = self.find_in_flight(&job.user_id, &job.source_url).await? {
                tracing::debug!(job_id = existing.id, user_id = %job.user_id, "duplicate submission, returning in-flight job");
                return Ok(Enqueued {
                    id: existing.id,
                    status: existing.status,
                    created: false,
                });
            }
        }
        Err(GateError::Storage(sqlx::Error::RowNotFound))
    }

    /// Move a job to `to`, writing `fields` alongside.
    ///
    /// Fails with `InvalidTransition` if `current -> to` is not a lifecycle edge
    /// or if the stored status changed underneath the caller.
    pub async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> GateResult<DownloadJob> {
        let current = self.get_status(id).await?;
        let from = current.status;
        if !from.can_transition_to(to, current.with_subtitles) {
            tracing::error!(job_id = id, %from, %to, "rejected invalid job transition");
            return Err(GateError::InvalidTransition { job_id: id, from, to });
        }

        let now = unix_timestamp();
        let admitted_at = (to == JobStatus::Admitted).then_some(now);
        let completed_at = to.is_terminal().then_some(now);
        let progress_floor: Option<i64> = (to == JobStatus::Completed).then_some(100);
        let error = match to {
            JobStatus::Failed => Some(fields.error.unwrap_or_else(|| "failed".to_string())),
            _ => None,
        };

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1,
                stage = COALESCE(?2, stage),
                error = ?3,
                file_url = COALESCE(?4, file_url),
                thumbnail_url = COALESCE(?5, thumbnail_url),
                duration_secs = COALESCE(?6, duration_secs),
                processing_time_ms = COALESCE(?7, processing_time_ms),
                admitted_at = COALESCE(?8, admitted_at),
                completed_at = COALESCE(?9, completed_at),
                progress = COALESCE(?10, progress),
                updated_at = ?11
            WHERE id = ?12 AND status = ?13
            "#,
        )
        .bind(to.as_str())
        .bind(&fields.stage)
        .bind(&error)
        .bind(&fields.file_url)
        .bind(&fields.thumbnail_url)
        .bind(fields.duration_secs)
        .bind(fields.processing_time_ms)
        .bind(admitted_at)
        .bind(completed_at)
        .bind(progress_floor)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let actual = self.get_status(id).await?.status;
            tracing::error!(job_id = id, expected = %from, %actual, %to, "job status changed concurrently");
            return Err(GateError::InvalidTransition {
                job_id: id,
                from: actual,
                to,
            });
        }

        self.emit(JobEvent {
            job_id: id,
            from,
            to,
            at: now,
        });
        tracing::debug!(job_id = id, %from, %to, "job transition");
        self.get_status(id).await
    }

    /// Persist worker progress for an active job.
    ///
    /// Progress never decreases and stays at most 99 until the job completes.
    /// Returns `false` when the job is no longer downloading/processing, which
    /// is how an external cancel is observed.
    pub async fn update_progress(
        &self,
        id: JobId,
        progress: u8,
        stage: Option<&str>,
    ) -> GateResult<bool> {
        let pct = i64::from(progress.min(MAX_ACTIVE_PROGRESS));
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = MAX(progress, ?1),
                stage = COALESCE(?2, stage),
                updated_at = ?3
            WHERE id = ?4 AND status IN ('downloading', 'processing')
            "#,
        )
        .bind(pct)
        .bind(stage)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish "gone" from "no longer active".
        self.get_status(id).await?;
        Ok(false)
    }

    /// Count a dispatch: increments `attempts` and records the proxy used.
    pub async fn record_dispatch(&self, id: JobId, proxy_id: &str) -> GateResult<u32> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                last_proxy_id = ?1,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(proxy_id)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(GateError::JobNotFound(id));
        }
        Ok(self.get_status(id).await?.attempts)
    }

    /// Return an active job to `pending` after a transient failure.
    ///
    /// Progress restarts at 0 for the next attempt; the error is kept in
    /// `last_error` (never in `error`, which is reserved for `failed`).
    pub async fn requeue(&self, id: JobId, last_error: &str) -> GateResult<DownloadJob> {
        let current = self.get_status(id).await?;
        if !current.status.is_active() {
            tracing::error!(job_id = id, from = %current.status, "rejected requeue of inactive job");
            return Err(GateError::InvalidTransition {
                job_id: id,
                from: current.status,
                to: JobStatus::Pending,
            });
        }

        let now = unix_timestamp();
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                progress = 0,
                stage = NULL,
                last_error = ?1,
                admitted_at = NULL,
                updated_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(last_error)
        .bind(now)
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let actual = self.get_status(id).await?.status;
            return Err(GateError::InvalidTransition {
                job_id: id,
                from: actual,
                to: JobStatus::Pending,
            });
        }

        self.emit(JobEvent {
            job_id: id,
            from: current.status,
            to: JobStatus::Pending,
            at: now,
        });
        self.get_status(id).await
    }

    /// Reset jobs left admitted/downloading/processing by a previous process to `pending`.
    /// Call before scheduling; their slot/proxy/user reservations died with that process.
    /// Returns the number of jobs reset.
    pub async fn recover_in_flight(&self) -> GateResult<u64> {
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                progress = 0,
                stage = NULL,
                admitted_at = NULL,
                updated_at = ?1
            WHERE status IN ('admitted', 'downloading', 'processing')
            "#,
        )
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }
}
