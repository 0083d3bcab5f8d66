//! System-wide snapshot: slot utilization, proxy health, queue depth and
//! per-user quotas.
//!
//! Everything except the transition counters is read from the owning
//! components at snapshot time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::admission::{UserAdmission, UserQuotaSnapshot};
use crate::error::GateResult;
use crate::job_queue::{unix_timestamp, JobEvent, JobQueue, JobStatus, StatusCounts};
use crate::proxy_pool::{ProxyPool, ProxyPoolStats, ProxySnapshot};
use crate::slots::{PlatformSlots, SlotUsage};

/// Queue depth by coarse state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl From<StatusCounts> for QueueStats {
    fn from(c: StatusCounts) -> Self {
        Self {
            waiting: c.pending,
            active: c.active(),
            completed: c.completed,
            failed: c.failed,
        }
    }
}

/// Point-in-time view of the whole gateway. Serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub platforms: Vec<SlotUsage>,
    pub proxies: ProxyPoolStats,
    pub proxy_details: Vec<ProxySnapshot>,
    pub queue: QueueStats,
    pub users: Vec<UserQuotaSnapshot>,
    /// Transitions observed by this process, keyed by target status.
    pub transitions_total: BTreeMap<String, u64>,
    /// Unix seconds.
    pub generated_at: i64,
}

/// Monotonic per-target-status transition counters.
#[derive(Debug, Default)]
struct TransitionCounters {
    by_status: [AtomicU64; JobStatus::ALL.len()],
}

impl TransitionCounters {
    fn index(status: JobStatus) -> usize {
        JobStatus::ALL
            .iter()
            .position(|s| *s == status)
            .unwrap_or_default()
    }

    fn record(&self, to: JobStatus) {
        self.by_status[Self::index(to)].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        JobStatus::ALL
            .into_iter()
            .map(|s| {
                (
                    s.as_str().to_string(),
                    self.by_status[Self::index(s)].load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

/// Computes [`SystemStats`] from the live components.
#[derive(Debug, Clone)]
pub struct StatsReporter {
    queue: JobQueue,
    slots: Arc<PlatformSlots>,
    proxies: Arc<ProxyPool>,
    admission: Arc<UserAdmission>,
    transitions: Arc<TransitionCounters>,
}

impl StatsReporter {
    pub fn new(
        queue: JobQueue,
        slots: Arc<PlatformSlots>,
        proxies: Arc<ProxyPool>,
        admission: Arc<UserAdmission>,
    ) -> Self {
        Self {
            queue,
            slots,
            proxies,
            admission,
            transitions: Arc::new(TransitionCounters::default()),
        }
    }

    /// Count one status change.
    pub fn record(&self, event: &JobEvent) {
        self.transitions.record(event.to);
    }

    /// Feed queue events into the transition counters until the queue is dropped.
    pub fn spawn_event_counter(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.queue.subscribe();
        let transitions = Arc::clone(&self.transitions);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => transitions.record(event.to),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "stats event counter lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn snapshot(&self) -> GateResult<SystemStats> {
        let counts = self.queue.count_by_status().await?;
        Ok(SystemStats {
            platforms: self.slots.snapshot(),
            proxies: self.proxies.stats(),
            proxy_details: self.proxies.snapshot(),
            queue: counts.into(),
            users: self.admission.snapshot(),
            transitions_total: self.transitions.snapshot(),
            generated_at: unix_timestamp(),
        })
    }
}

/// Where a running scheduler publishes its snapshot: `~/.local/state/clipgate/stats.json`.
pub fn default_stats_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("clipgate")?;
    Ok(xdg_dirs.get_state_home().join("stats.json"))
}

/// Write `stats` as pretty JSON, replacing `path` atomically.
pub fn write_stats_file(path: &Path, stats: &SystemStats) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(stats)?;
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

/// Last published snapshot, if any.
pub fn read_stats_file(path: &Path) -> Result<Option<SystemStats>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let stats = serde_json::from_slice(&data)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(stats))
}
