//! Per-user admission: concurrency ceiling and submission rate limit.
//!
//! The rate limit is a fixed window that resets wholesale once it expires,
//! so a user can burst up to twice the cap across a window boundary. The
//! counter decays with time only; finishing a job never gives a request back.
//! Concurrency is counted separately and released when a job stops running.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::UserLimitsConfig;

/// Why a user was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("rate limited ({limit} requests per window, retry in {}s)", retry_after.as_secs())]
    RateLimited { limit: u32, retry_after: Duration },
    #[error("concurrency exceeded ({limit} active jobs)")]
    ConcurrencyExceeded { limit: usize },
}

/// Limits enforced per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLimits {
    pub max_concurrent_jobs: usize,
    pub max_requests_per_window: u32,
    pub window: Duration,
}

impl From<&UserLimitsConfig> for UserLimits {
    fn from(cfg: &UserLimitsConfig) -> Self {
        Self {
            max_concurrent_jobs: cfg.max_concurrent_jobs.max(1),
            max_requests_per_window: cfg.max_requests_per_window.max(1),
            window: Duration::from_secs(cfg.window_secs.max(1)),
        }
    }
}

impl Default for UserLimits {
    fn default() -> Self {
        Self::from(&UserLimitsConfig::default())
    }
}

#[derive(Debug)]
struct UserQuotaState {
    active_jobs: usize,
    window_start: Instant,
    requests_in_window: u32,
}

impl UserQuotaState {
    fn new(now: Instant) -> Self {
        Self {
            active_jobs: 0,
            window_start: now,
            requests_in_window: 0,
        }
    }

    /// Start a fresh window if the current one has expired.
    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.requests_in_window = 0;
        }
    }

    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.active_jobs == 0 && now.duration_since(self.window_start) >= window
    }
}

/// Read-only view of one user's quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuotaSnapshot {
    pub user_id: String,
    pub active_jobs: usize,
    pub rate_limit_remaining: u32,
    pub window_resets_in_secs: u64,
}

/// Owns every user's quota counters behind one mutex.
///
/// The lock is never held across an await point.
#[derive(Debug)]
pub struct UserAdmission {
    limits: UserLimits,
    users: Mutex<HashMap<String, UserQuotaState>>,
}

impl UserAdmission {
    pub fn new(limits: UserLimits) -> Self {
        Self {
            limits,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> UserLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserQuotaState>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Charge one submission against the user's rate window.
    ///
    /// Denies with `RateLimited` when the window is already full; the denied
    /// request is not counted. Users with no running jobs and an expired
    /// window are forgotten here.
    pub fn try_register_request(&self, user_id: &str) -> Result<(), AdmissionDenied> {
        let now = Instant::now();
        let mut users = self.lock();
        let window = self.limits.window;
        users.retain(|_, s| !s.is_idle(now, window));
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserQuotaState::new(now));
        state.roll_window(now, self.limits.window);

        if state.requests_in_window >= self.limits.max_requests_per_window {
            let elapsed = now.duration_since(state.window_start);
            let retry_after = self.limits.window.saturating_sub(elapsed);
            tracing::debug!(user_id, requests = state.requests_in_window, "submission rate limited");
            return Err(AdmissionDenied::RateLimited {
                limit: self.limits.max_requests_per_window,
                retry_after,
            });
        }
        state.requests_in_window += 1;
        Ok(())
    }

    /// Reserve one concurrent-job slot for the user.
    ///
    /// Denies with `ConcurrencyExceeded` when the user is at the ceiling. Every
    /// success must be paired with exactly one [`release`](Self::release).
    pub fn try_admit_user(&self, user_id: &str) -> Result<(), AdmissionDenied> {
        let now = Instant::now();
        let mut users = self.lock();
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserQuotaState::new(now));

        if state.active_jobs >= self.limits.max_concurrent_jobs {
            return Err(AdmissionDenied::ConcurrencyExceeded {
                limit: self.limits.max_concurrent_jobs,
            });
        }
        state.active_jobs += 1;
        Ok(())
    }

    /// Give back a concurrent-job slot when a job stops running.
    pub fn release(&self, user_id: &str) {
        let now = Instant::now();
        let mut users = self.lock();
        match users.get_mut(user_id) {
            Some(state) if state.active_jobs > 0 => {
                state.active_jobs -= 1;
                if state.is_idle(now, self.limits.window) {
                    users.remove(user_id);
                }
            }
            _ => tracing::error!(user_id, "user release without a matching admission"),
        }
    }

    /// Whether this process holds any quota state for the user.
    pub fn is_tracked(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }

    /// Adopt a rate window recorded before this process started: `requests`
    /// submissions, the oldest `age` ago.
    ///
    /// Only applies to users this process has no state for yet, and only
    /// while that window is still open.
    pub fn restore_window(&self, user_id: &str, requests: u32, age: Duration) {
        if requests == 0 || age >= self.limits.window {
            return;
        }
        let now = Instant::now();
        let window_start = now.checked_sub(age).unwrap_or(now);
        self.lock()
            .entry(user_id.to_string())
            .or_insert_with(|| UserQuotaState {
                active_jobs: 0,
                window_start,
                requests_in_window: requests,
            });
    }

    pub fn active_jobs(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map_or(0, |s| s.active_jobs)
    }

    /// Current quota view for one user (a fresh user has the full allowance).
    pub fn quota(&self, user_id: &str) -> UserQuotaSnapshot {
        let now = Instant::now();
        let users = self.lock();
        match users.get(user_id) {
            Some(state) => self.snapshot_of(user_id, state, now),
            None => UserQuotaSnapshot {
                user_id: user_id.to_string(),
                active_jobs: 0,
                rate_limit_remaining: self.limits.max_requests_per_window,
                window_resets_in_secs: 0,
            },
        }
    }

    /// Quotas of all users with running jobs or an open window, sorted by user id.
    pub fn snapshot(&self) -> Vec<UserQuotaSnapshot> {
        let now = Instant::now();
        let users = self.lock();
        let mut out: Vec<_> = users
            .iter()
            .filter(|(_, s)| !s.is_idle(now, self.limits.window))
            .map(|(id, s)| self.snapshot_of(id, s, now))
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    fn snapshot_of(&self, user_id: &str, state: &UserQuotaState, now: Instant) -> UserQuotaSnapshot {
        let elapsed = now.duration_since(state.window_start);
        let (used, resets_in) = if elapsed >= self.limits.window {
            (0, Duration::ZERO)
        } else {
            (state.requests_in_window, self.limits.window - elapsed)
        };
        UserQuotaSnapshot {
            user_id: user_id.to_string(),
            active_jobs: state.active_jobs,
            rate_limit_remaining: self.limits.max_requests_per_window.saturating_sub(used),
            window_resets_in_secs: resets_in.as_secs(),
        }
    }
}
