//! Types stored in and returned by the job queue.

use std::fmt;

use serde::Serialize;

use crate::platform::Platform;

/// Job identifier.
pub type JobId = i64;

/// Lifecycle status, stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Admitted,
    Downloading,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Admitted,
        JobStatus::Downloading,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Admitted => "admitted",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobStatus::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Holding platform/proxy/user resources (dispatched to a worker).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Admitted | JobStatus::Downloading | JobStatus::Processing
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle state machine.
    ///
    /// Jobs without subtitles have no processing step and may complete
    /// directly from `downloading`.
    pub fn can_transition_to(self, to: JobStatus, with_subtitles: bool) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending, Admitted)
            | (Admitted, Downloading)
            | (Downloading, Processing)
            | (Processing, Completed) => true,
            (Downloading, Completed) => !with_subtitles,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::parse(s).ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Full job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: JobId,
    pub user_id: String,
    pub source_url: String,
    pub platform: Platform,
    pub with_subtitles: bool,
    pub status: JobStatus,
    /// 0-100; reaches 100 only on `completed`.
    pub progress: u8,
    /// Human-readable current step ("downloading", "uploading", ...).
    pub stage: Option<String>,
    /// Set only when `status == failed`.
    pub error: Option<String>,
    /// Most recent transient error that sent the job back to `pending`.
    pub last_error: Option<String>,
    /// Number of times the job has been dispatched to a worker.
    pub attempts: u32,
    pub last_proxy_id: Option<String>,
    pub file_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
    pub processing_time_ms: Option<i64>,
    pub created_at: i64,
    pub admitted_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

/// Submission data for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub source_url: String,
    pub platform: Platform,
    pub with_subtitles: bool,
}

/// Result of `enqueue`: either a fresh job or the existing in-flight one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: JobId,
    pub status: JobStatus,
    /// False when an in-flight job for the same (user, url) was returned instead.
    pub created: bool,
}

/// Optional fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub stage: Option<String>,
    pub error: Option<String>,
    pub file_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
    pub processing_time_ms: Option<i64>,
}

impl TransitionFields {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Emitted on every status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    /// Unix seconds.
    pub at: i64,
}

/// Jobs one user created since some cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentSubmissions {
    pub user_id: String,
    pub count: u32,
    /// Unix seconds.
    pub oldest_at: i64,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub admitted: u64,
    pub downloading: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Admitted => self.admitted,
            JobStatus::Downloading => self.downloading,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Admitted => self.admitted += n,
            JobStatus::Downloading => self.downloading += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }

    /// Jobs currently dispatched (admitted, downloading or processing).
    pub fn active(&self) -> u64 {
        self.admitted + self.downloading + self.processing
    }
}
