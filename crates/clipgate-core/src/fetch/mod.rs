//! External collaborators: the fetch tool, durable storage and the subtitle
//! pipeline.
//!
//! The scheduler never talks to these directly; workers do. Each is a trait
//! so the process-backed defaults can be swapped for in-process fakes.

mod progress;
mod storage;
mod subtitles;
mod ytdlp;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::job_queue::JobId;
use crate::platform::Platform;
use crate::proxy_pool::ProxyLease;
use crate::retry::ErrorKind;

pub use progress::ProgressReporter;
pub use storage::LocalDirStorage;
pub use subtitles::CommandSubtitler;
pub use ytdlp::{parse_progress_line, YtDlpFetcher};

/// Everything a fetcher needs for one attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: JobId,
    pub user_id: String,
    pub source_url: String,
    pub platform: Platform,
    pub proxy: ProxyLease,
    /// Per-attempt scratch directory; the fetched file lands inside it.
    pub work_dir: PathBuf,
}

/// Metadata reported by the fetch tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub duration_secs: Option<f64>,
    pub thumbnail_url: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub file_path: PathBuf,
    pub metadata: MediaMetadata,
}

/// Outcome of a failed fetch, subtitle or upload step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Worth retrying (possibly through another proxy).
    #[error("{kind:?}: {message}")]
    Transient { kind: ErrorKind, message: String },
    /// Retrying cannot help.
    #[error("{0}")]
    Permanent(String),
    /// The job's abort token was set.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Build the variant matching `kind`.
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_retryable() {
            FetchError::Transient { kind, message }
        } else {
            FetchError::Permanent(message)
        }
    }

    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        FetchError::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Whether the proxy should be blamed for this failure.
    pub fn counts_against_proxy(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Downloads one video through a proxy.
#[async_trait]
pub trait VideoFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressReporter,
    ) -> Result<FetchOutput, FetchError>;
}

/// Moves a finished file to durable storage and returns its URL.
#[async_trait]
pub trait StorageUploader: Send + Sync {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, FetchError>;
}

/// Produces a subtitled copy of a video and returns its path.
#[async_trait]
pub trait SubtitlePipeline: Send + Sync {
    async fn generate(
        &self,
        input: &Path,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, FetchError>;
}

/// Storage key for a job's output: `downloads/{user_id}/{job_id}/{file}`.
pub fn storage_key(user_id: &str, job_id: JobId, file: &Path) -> String {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string());
    format!("downloads/{}/{}/{}", sanitize_segment(user_id), job_id, name)
}

/// Keep a key segment to one path component.
fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
