//! Per-proxy state and the views handed out of the pool.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Mutable state of one registered proxy. Owned by the pool.
#[derive(Debug, Clone)]
pub(super) struct ProxyEntry {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Set while quarantined; `healthy` is false until it passes.
    pub quarantine_until: Option<Instant>,
    /// Jobs currently holding a lease on this proxy.
    pub in_flight: u32,
    /// Assignment sequence number of the last lease (0 = never assigned).
    pub last_assigned: u64,
}

impl ProxyEntry {
    pub fn new(id: String, address: String) -> Self {
        Self {
            id,
            address,
            healthy: true,
            consecutive_failures: 0,
            quarantine_until: None,
            in_flight: 0,
            last_assigned: 0,
        }
    }

    /// Lift an expired quarantine. Returns true if the proxy was re-admitted.
    pub fn readmit_if_elapsed(&mut self, now: Instant) -> bool {
        match self.quarantine_until {
            Some(until) if until <= now => {
                self.quarantine_until = None;
                self.healthy = true;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, now: Instant) -> ProxySnapshot {
        ProxySnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            quarantined_for_secs: self
                .quarantine_until
                .map(|until| until.saturating_duration_since(now).as_secs()),
            in_flight: self.in_flight,
        }
    }
}

/// A proxy handed to one admitted job. Return it with
/// `ProxyPool::report_outcome` or `ProxyPool::release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    pub id: String,
    pub address: String,
}

/// Read-only view of one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySnapshot {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Remaining quarantine; `Some(0)` means it will be re-admitted on next use.
    pub quarantined_for_secs: Option<u64>,
    pub in_flight: u32,
}

/// Pool-level aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    /// Proxies with at least one lease outstanding.
    pub in_use: usize,
    /// `in_use / total`.
    pub utilization: f64,
}

impl ProxyPoolStats {
    pub(super) fn from_entries(entries: &[ProxyEntry]) -> Self {
        let total = entries.len();
        let healthy = entries.iter().filter(|e| e.healthy).count();
        let quarantined = entries.iter().filter(|e| e.quarantine_until.is_some()).count();
        let in_use = entries.iter().filter(|e| e.in_flight > 0).count();
        Self {
            total,
            healthy,
            quarantined,
            in_use,
            utilization: if total == 0 { 0.0 } else { in_use as f64 / total as f64 },
        }
    }
}

