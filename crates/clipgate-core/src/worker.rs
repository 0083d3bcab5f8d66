//! Worker pool: runs one admitted job against the fetch/subtitle/storage
//! collaborators and streams events back to the scheduler.
//!
//! Workers never touch the job queue. Everything they learn goes out as a
//! [`WorkerEvent`]; every spawned job ends with exactly one `Finished`,
//! including on timeout or panic.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::GateConfig;
use crate::fetch::{
    storage_key, CommandSubtitler, FetchError, FetchRequest, LocalDirStorage, ProgressReporter,
    StorageUploader, SubtitlePipeline, VideoFetcher, YtDlpFetcher,
};
use crate::job_queue::{DownloadJob, JobId};
use crate::proxy_pool::ProxyLease;
use crate::retry::ErrorKind;

/// Progress slices of the job's 0–99 range.
const FETCH_END: u8 = 90;
const FETCH_END_WITH_SUBTITLES: u8 = 80;
const SUBTITLES_END: u8 = 95;
const UPLOAD_END: u8 = 99;

/// Messages from workers to the scheduler.
#[derive(Debug)]
pub enum WorkerEvent {
    Progress {
        job_id: JobId,
        percent: u8,
        stage: Option<String>,
    },
    /// Download done; post-processing (subtitles) starts.
    Processing { job_id: JobId, stage: String },
    Finished {
        job_id: JobId,
        result: Result<WorkerOutput, FetchError>,
    },
}

/// What a successful job produced.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutput {
    pub file_url: String,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
    pub processing_time_ms: i64,
}

/// One dispatched attempt.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub job: DownloadJob,
    pub proxy: ProxyLease,
    pub attempt: u32,
    pub abort: Arc<AtomicBool>,
}

/// The external collaborators a worker drives.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn VideoFetcher>,
    pub storage: Arc<dyn StorageUploader>,
    pub subtitles: Arc<dyn SubtitlePipeline>,
}

impl Collaborators {
    /// yt-dlp, local-directory storage and the configured subtitle command.
    pub fn from_config(cfg: &GateConfig) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Arc::new(YtDlpFetcher::new(cfg.tools.ytdlp_path.clone())),
            storage: Arc::new(LocalDirStorage::new(cfg.storage_dir_or_default()?)),
            subtitles: Arc::new(CommandSubtitler::new(cfg.tools.subtitle_command.clone())),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Maximum jobs executing at once.
    pub workers: usize,
    /// Scratch space; each attempt gets its own subdirectory.
    pub download_dir: PathBuf,
    /// Wall-clock ceiling for one attempt.
    pub timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(cfg: &GateConfig) -> anyhow::Result<Self> {
        Ok(Self {
            workers: cfg.workers.max(1),
            download_dir: cfg.download_dir_or_default()?,
            timeout: cfg.worker_timeout(),
        })
    }
}

/// Capacity for one worker, reserved before admission is attempted.
#[derive(Debug)]
pub struct WorkerPermit(OwnedSemaphorePermit);

#[derive(Clone)]
struct WorkerContext {
    collaborators: Collaborators,
    download_dir: PathBuf,
    timeout: Duration,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Bounded pool of worker tasks.
pub struct WorkerPool {
    ctx: WorkerContext,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Pool plus the receiving end of its event channel (owned by the scheduler).
    pub fn new(
        collaborators: Collaborators,
        settings: WorkerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Self {
            ctx: WorkerContext {
                collaborators,
                download_dir: settings.download_dir,
                timeout: settings.timeout,
                events,
            },
            semaphore: Arc::new(Semaphore::new(settings.workers.max(1))),
        };
        (pool, rx)
    }

    /// Reserve worker capacity without waiting.
    pub fn try_reserve(&self) -> Option<WorkerPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(WorkerPermit)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `task` in the background. Its `Finished` event arrives on the pool's channel.
    pub fn spawn(&self, permit: WorkerPermit, task: WorkerTask) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let job_id = task.job.id;
            let inner = {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.execute_with_timeout(&task).await })
            };
            let result = match inner.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    tracing::error!(job_id, "worker panicked");
                    Err(FetchError::transient(ErrorKind::Unknown, "worker panicked"))
                }
                Err(e) => Err(FetchError::transient(ErrorKind::Unknown, e.to_string())),
            };
            // Capacity is back before the scheduler hears about it.
            drop(permit);
            let _ = ctx.events.send(WorkerEvent::Finished { job_id, result });
        });
    }

    /// Execute one attempt in the caller's task, bounded by the worker timeout.
    pub async fn execute(&self, task: &WorkerTask) -> Result<WorkerOutput, FetchError> {
        self.ctx.execute_with_timeout(task).await
    }
}

impl WorkerContext {
    async fn execute_with_timeout(&self, task: &WorkerTask) -> Result<WorkerOutput, FetchError> {
        let work_dir = self
            .download_dir
            .join(format!("job-{}-{}", task.job.id, task.attempt));
        let result = match tokio::time::timeout(self.timeout, self.run(task, &work_dir)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(job_id = task.job.id, "worker timed out after {}s", self.timeout.as_secs());
                Err(FetchError::transient(
                    ErrorKind::Timeout,
                    format!("worker timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {}: {}", work_dir.display(), e);
            }
        }
        result
    }

    async fn run(
        &self,
        task: &WorkerTask,
        work_dir: &std::path::Path,
    ) -> Result<WorkerOutput, FetchError> {
        let started = Instant::now();
        let job = &task.job;
        let progress = ProgressReporter::new(job.id, Arc::clone(&task.abort), self.events.clone());

        let fetch_end = if job.with_subtitles {
            FETCH_END_WITH_SUBTITLES
        } else {
            FETCH_END
        };
        let fetch_progress = progress.scoped(0, fetch_end);
        fetch_progress.stage("downloading")?;
        let request = FetchRequest {
            job_id: job.id,
            user_id: job.user_id.clone(),
            source_url: job.source_url.clone(),
            platform: job.platform,
            proxy: task.proxy.clone(),
            work_dir: work_dir.to_path_buf(),
        };
        let fetched = self
            .collaborators
            .fetcher
            .fetch(&request, &fetch_progress)
            .await?;
        let mut file = fetched.file_path;

        if job.with_subtitles {
            progress.check()?;
            let stage = "generating subtitles".to_string();
            progress.send(WorkerEvent::Processing {
                job_id: job.id,
                stage: stage.clone(),
            });
            let subs_progress = progress.scoped(fetch_end, SUBTITLES_END);
            let subtitled = self
                .collaborators
                .subtitles
                .generate(&file, &subs_progress)
                .await?;
            if subtitled != file {
                let _ = tokio::fs::remove_file(&file).await;
            }
            file = subtitled;
        }

        let upload_progress = progress.scoped(SUBTITLES_END, UPLOAD_END);
        upload_progress.stage("uploading")?;
        let key = storage_key(&job.user_id, job.id, &file);
        let file_url = self.collaborators.storage.upload(&file, &key).await?;
        upload_progress.report(100.0)?;

        let processing_time_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        tracing::info!(job_id = job.id, %file_url, processing_time_ms, "job output stored");
        Ok(WorkerOutput {
            file_url,
            thumbnail_url: fetched.metadata.thumbnail_url,
            duration_secs: fetched.metadata.duration_secs,
            processing_time_ms,
        })
    }
}
