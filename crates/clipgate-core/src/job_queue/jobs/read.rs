//! Job read operations: get, list, counts.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{GateError, GateResult};
use crate::platform::Platform;

use super::super::db::JobQueue;
use super::super::types::{DownloadJob, JobId, JobStatus, RecentSubmissions, StatusCounts};

const JOB_COLUMNS: &str = r#"
    id, user_id, source_url, platform, with_subtitles, status, progress, stage,
    error, last_error, attempts, last_proxy_id, file_url, thumbnail_url,
    duration_secs, processing_time_ms, created_at, admitted_at, completed_at, updated_at
"#;

fn job_from_row(row: &SqliteRow) -> GateResult<DownloadJob> {
    let id: i64 = row.try_get("id")?;
    let platform_str: String = row.try_get("platform")?;
    let status_str: String = row.try_get("status")?;
    let platform: Platform = platform_str.parse().map_err(|detail| GateError::CorruptRecord {
        job_id: id,
        detail,
    })?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| GateError::CorruptRecord {
        job_id: id,
        detail: format!("unknown status {status_str}"),
    })?;
    let progress: i64 = row.try_get("progress")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(DownloadJob {
        id,
        user_id: row.try_get("user_id")?,
        source_url: row.try_get("source_url")?,
        platform,
        with_subtitles: row.try_get("with_subtitles")?,
        status,
        progress: progress.clamp(0, 100) as u8,
        stage: row.try_get("stage")?,
        error: row.try_get("error")?,
        last_error: row.try_get("last_error")?,
        attempts: attempts.max(0) as u32,
        last_proxy_id: row.try_get("last_proxy_id")?,
        file_url: row.try_get("file_url")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        duration_secs: row.try_get("duration_secs")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        created_at: row.try_get("created_at")?,
        admitted_at: row.try_get("admitted_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl JobQueue {
    /// Fetch a job, or `None` if it does not exist.
    pub async fn find_job(&self, id: JobId) -> GateResult<Option<DownloadJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Current record for a job (the `status` query exposed to callers).
    pub async fn get_status(&self, id: JobId) -> GateResult<DownloadJob> {
        self.find_job(id).await?.ok_or(GateError::JobNotFound(id))
    }

    /// All jobs in `status`, oldest submission first.
    pub async fn list_by_status(&self, status: JobStatus) -> GateResult<Vec<DownloadJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> GateResult<Vec<DownloadJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// The non-terminal job for `(user_id, source_url)`, if any.
    pub async fn find_in_flight(
        &self,
        user_id: &str,
        source_url: &str,
    ) -> GateResult<Option<DownloadJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE user_id = ?1 AND source_url = ?2 AND status NOT IN ('completed', 'failed')
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs created at or after `since` (unix seconds), grouped by user.
    /// Every submission that made it into the queue counts, whatever its status now.
    pub async fn submissions_since(
        &self,
        since: i64,
        user_id: Option<&str>,
    ) -> GateResult<Vec<RecentSubmissions>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, COUNT(*) AS n, MIN(created_at) AS oldest
            FROM jobs
            WHERE created_at >= ?1 AND (?2 IS NULL OR user_id = ?2)
            GROUP BY user_id
            ORDER BY user_id
            "#,
        )
        .bind(since)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> GateResult<RecentSubmissions> {
                let n: i64 = row.try_get("n")?;
                Ok(RecentSubmissions {
                    user_id: row.try_get("user_id")?,
                    count: u32::try_from(n).unwrap_or(u32::MAX),
                    oldest_at: row.try_get("oldest")?,
                })
            })
            .collect()
    }

    /// Number of jobs per status.
    pub async fn count_by_status(&self) -> GateResult<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match JobStatus::parse(&status) {
                Some(st) => counts.add(st, n.max(0) as u64),
                None => tracing::warn!(status, "ignoring jobs with unknown status"),
            }
        }
        Ok(counts)
    }
}
