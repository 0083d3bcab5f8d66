//! In-memory stand-ins for the fetch tool, storage and subtitle pipeline.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clipgate_core::fetch::{
    FetchError, FetchOutput, FetchRequest, MediaMetadata, ProgressReporter, StorageUploader,
    SubtitlePipeline, VideoFetcher,
};
use clipgate_core::job_queue::JobId;
use clipgate_core::worker::Collaborators;
use tokio::sync::Semaphore;

/// Fetcher that fails from a script first, then optionally waits for the
/// test to open its gate, then "downloads" a small file.
#[derive(Default)]
pub struct MockFetcher {
    failures: Mutex<VecDeque<FetchError>>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<(JobId, String)>>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every fetch blocks until the returned semaphore hands out a permit.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (Arc::new(fetcher), gate)
    }

    pub fn failing_with(failures: impl IntoIterator<Item = FetchError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into_iter().collect()),
            ..Self::default()
        })
    }

    /// `(job_id, proxy_id)` per fetch call, in call order.
    pub fn calls(&self) -> Vec<(JobId, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VideoFetcher for MockFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressReporter,
    ) -> Result<FetchOutput, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.job_id, request.proxy.id.clone()));
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        progress.report(10.0)?;
        if let Some(gate) = &self.gate {
            loop {
                if let Ok(permit) = gate.try_acquire() {
                    permit.forget();
                    break;
                }
                progress.check()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        for pct in [40.0, 70.0, 100.0] {
            progress.report(pct)?;
        }
        tokio::fs::create_dir_all(&request.work_dir).await.unwrap();
        let file_path = request.work_dir.join(format!("{}.mp4", request.job_id));
        tokio::fs::write(&file_path, b"not really a video").await.unwrap();
        Ok(FetchOutput {
            file_path,
            metadata: MediaMetadata {
                duration_secs: Some(30.0),
                thumbnail_url: None,
                title: Some("clip".to_string()),
            },
        })
    }
}

/// Records upload keys and returns `mem://` URLs.
#[derive(Default)]
pub struct MemoryStorage {
    keys: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageUploader for MemoryStorage {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, FetchError> {
        assert!(local.exists(), "uploaded file must exist: {}", local.display());
        self.keys.lock().unwrap().push(key.to_string());
        Ok(format!("mem://{key}"))
    }
}

/// Subtitle pipeline that returns its input unchanged.
pub struct PassthroughSubtitles;

#[async_trait]
impl SubtitlePipeline for PassthroughSubtitles {
    async fn generate(
        &self,
        input: &Path,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, FetchError> {
        progress.report(100.0)?;
        Ok(input.to_path_buf())
    }
}

pub fn collaborators(fetcher: Arc<MockFetcher>, storage: Arc<MemoryStorage>) -> Collaborators {
    Collaborators {
        fetcher,
        storage,
        subtitles: Arc::new(PassthroughSubtitles),
    }
}
