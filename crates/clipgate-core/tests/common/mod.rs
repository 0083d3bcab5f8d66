//! Shared helpers for scheduler integration tests: in-memory collaborators,
//! a fast scheduler configuration and polling helpers.

#![allow(dead_code)]

pub mod collaborators;

use std::future::Future;
use std::time::Duration;

use clipgate_core::config::{GateConfig, ProxyConfig};
use clipgate_core::job_queue::{DownloadJob, JobStatus};
use clipgate_core::retry::RetryPolicy;
use clipgate_core::scheduler::{Scheduler, SchedulerSettings};
use clipgate_core::worker::WorkerSettings;
use clipgate_core::Gateway;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn config_with_proxies(ids: &[&str]) -> GateConfig {
    let mut cfg = GateConfig::default();
    cfg.proxies = ids
        .iter()
        .map(|id| ProxyConfig {
            id: id.to_string(),
            address: format!("http://{id}.proxy.test:3128"),
        })
        .collect();
    cfg
}

pub fn fast_settings(max_attempts: u32) -> SchedulerSettings {
    SchedulerSettings {
        poll_interval: Duration::from_millis(10),
        max_admission_wait: Duration::from_secs(60),
        admission_backoff_max: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    }
}

pub fn worker_settings(dir: &std::path::Path) -> WorkerSettings {
    WorkerSettings {
        workers: 8,
        download_dir: dir.to_path_buf(),
        timeout: Duration::from_secs(10),
    }
}

/// A scheduler running on its own task.
pub struct RunningScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningScheduler {
    pub fn start(mut scheduler: Scheduler) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("scheduler stops within 5s")
            .expect("scheduler task")
            .expect("scheduler run");
    }
}

/// Poll `check` every 10ms until it returns true; panics after 5s.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn jobs(gw: &Gateway) -> Vec<DownloadJob> {
    let mut jobs = gw.list(None).await.unwrap();
    jobs.sort_by_key(|j| j.id);
    jobs
}

pub async fn count(gw: &Gateway, status: JobStatus) -> usize {
    gw.list(Some(status)).await.unwrap().len()
}
