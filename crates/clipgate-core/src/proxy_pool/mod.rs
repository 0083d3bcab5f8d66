//! Egress proxy pool with failure-driven quarantine.
//!
//! Health is learned from job outcomes only; there is no active health
//! checker. A proxy that fails `failure_threshold` times in a row is
//! quarantined with exponential backoff. Quarantined proxies are re-admitted
//! lazily: every assignment first re-checks expired quarantines, so the pool
//! heals itself without a timer task. A re-admitted proxy keeps its failure
//! count, so one more failure sends it straight back with a longer backoff.

mod entry;
mod pool;

pub use entry::{ProxyLease, ProxyPoolStats, ProxySnapshot};
pub use pool::{quarantine_backoff, ProxyError, ProxyPolicy, ProxyPool};

#[cfg(test)]
mod tests;
