//! The pool itself: assignment, outcome reporting, quarantine.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{ProxyConfig, ProxyPolicyConfig};

use super::entry::{ProxyEntry, ProxyLease, ProxyPoolStats, ProxySnapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown proxy {0}")]
    UnknownProxy(String),
    #[error("proxy {0} is already registered")]
    Duplicate(String),
    #[error("proxy {id} still has {in_flight} job(s) in flight")]
    ProxyInUse { id: String, in_flight: u32 },
}

/// Quarantine thresholds and backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPolicy {
    pub failure_threshold: u32,
    pub base_quarantine: Duration,
    pub max_quarantine: Duration,
}

impl From<&ProxyPolicyConfig> for ProxyPolicy {
    fn from(cfg: &ProxyPolicyConfig) -> Self {
        let base = Duration::from_secs(cfg.base_quarantine_secs.max(1));
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            base_quarantine: base,
            max_quarantine: Duration::from_secs(cfg.max_quarantine_secs).max(base),
        }
    }
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self::from(&ProxyPolicyConfig::default())
    }
}

/// Quarantine length after `consecutive_failures` failures in a row:
/// `base * 2^(failures - threshold)`, capped at `max_quarantine`.
pub fn quarantine_backoff(consecutive_failures: u32, policy: &ProxyPolicy) -> Duration {
    let steps = consecutive_failures
        .saturating_sub(policy.failure_threshold)
        .min(16);
    policy
        .base_quarantine
        .saturating_mul(1u32 << steps)
        .min(policy.max_quarantine)
}

/// Owns every proxy's health state behind one mutex.
#[derive(Debug)]
pub struct ProxyPool {
    policy: ProxyPolicy,
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    entries: Vec<ProxyEntry>,
    next_seq: u64,
}

impl ProxyPool {
    pub fn new(policy: ProxyPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                next_seq: 1,
            }),
        }
    }

    /// Pool with the proxies from config registered (duplicate ids are skipped with a warning).
    pub fn from_config(policy: ProxyPolicy, proxies: &[ProxyConfig]) -> Self {
        let pool = Self::new(policy);
        for p in proxies {
            if let Err(e) = pool.register(&p.id, &p.address) {
                tracing::warn!("skipping proxy from config: {}", e);
            }
        }
        pool
    }

    pub fn policy(&self) -> ProxyPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: &str, address: &str) -> Result<(), ProxyError> {
        let mut inner = self.lock();
        if inner.entries.iter().any(|e| e.id == id) {
            return Err(ProxyError::Duplicate(id.to_string()));
        }
        inner
            .entries
            .push(ProxyEntry::new(id.to_string(), address.to_string()));
        tracing::info!(proxy_id = id, "proxy registered");
        Ok(())
    }

    /// Remove a proxy. Refused while any job still holds a lease on it.
    pub fn deregister(&self, id: &str) -> Result<(), ProxyError> {
        let mut inner = self.lock();
        let idx = inner
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| ProxyError::UnknownProxy(id.to_string()))?;
        let in_flight = inner.entries[idx].in_flight;
        if in_flight > 0 {
            return Err(ProxyError::ProxyInUse {
                id: id.to_string(),
                in_flight,
            });
        }
        inner.entries.remove(idx);
        Ok(())
    }

    /// Lease the least-recently-assigned healthy proxy, or `None` if none is healthy.
    pub fn try_assign(&self) -> Option<ProxyLease> {
        self.try_assign_avoiding(None)
    }

    /// Like [`try_assign`](Self::try_assign) but prefers any proxy other than
    /// `avoid`; the avoided proxy is still used if it is the only healthy one.
    pub fn try_assign_avoiding(&self, avoid: Option<&str>) -> Option<ProxyLease> {
        let now = Instant::now();
        let mut inner = self.lock();
        for entry in inner.entries.iter_mut() {
            if entry.readmit_if_elapsed(now) {
                tracing::info!(proxy_id = %entry.id, "proxy quarantine elapsed, re-admitted");
            }
        }

        let pick = |skip_avoided: bool| {
            inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.healthy)
                .filter(|(_, e)| !(skip_avoided && Some(e.id.as_str()) == avoid))
                .min_by_key(|(_, e)| e.last_assigned)
                .map(|(i, _)| i)
        };
        let idx = pick(true).or_else(|| pick(false))?;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = &mut inner.entries[idx];
        entry.last_assigned = seq;
        entry.in_flight += 1;
        Some(ProxyLease {
            id: entry.id.clone(),
            address: entry.address.clone(),
        })
    }

    /// Record how a job using `proxy_id` went and return its lease.
    ///
    /// Failures count towards quarantine; a success clears the count and, if
    /// the quarantine window has passed, re-admits the proxy.
    pub fn report_outcome(&self, proxy_id: &str, success: bool) -> Result<(), ProxyError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == proxy_id)
            .ok_or_else(|| ProxyError::UnknownProxy(proxy_id.to_string()))?;
        entry.in_flight = entry.in_flight.saturating_sub(1);

        if success {
            entry.consecutive_failures = 0;
            entry.readmit_if_elapsed(now);
            return Ok(());
        }

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= self.policy.failure_threshold {
            let backoff = quarantine_backoff(entry.consecutive_failures, &self.policy);
            entry.healthy = false;
            entry.quarantine_until = Some(now + backoff);
            tracing::warn!(
                proxy_id,
                failures = entry.consecutive_failures,
                backoff_secs = backoff.as_secs(),
                "proxy quarantined"
            );
        }
        Ok(())
    }

    /// Return a lease without an outcome (rollback or cancellation).
    pub fn release(&self, proxy_id: &str) -> Result<(), ProxyError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == proxy_id)
            .ok_or_else(|| ProxyError::UnknownProxy(proxy_id.to_string()))?;
        entry.in_flight = entry.in_flight.saturating_sub(1);
        Ok(())
    }

    /// Per-proxy view, in registration order.
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let now = Instant::now();
        self.lock().entries.iter().map(|e| e.snapshot(now)).collect()
    }

    pub fn stats(&self) -> ProxyPoolStats {
        ProxyPoolStats::from_entries(&self.lock().entries)
    }
}
