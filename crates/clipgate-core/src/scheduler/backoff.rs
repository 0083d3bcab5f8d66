//! Per-job eligibility: admission deferrals and retry delays.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::job_queue::JobId;
use crate::retry::admission_backoff;

#[derive(Debug, Clone, Copy)]
struct Deferral {
    /// Consecutive admission denials since the job last became eligible.
    deferrals: u32,
    /// First denial of the current streak; the admission timeout counts from here.
    first_denied: Option<Instant>,
    next_eligible: Instant,
}

/// Pending jobs the scheduler should skip until a point in time.
#[derive(Debug, Default)]
pub(super) struct BackoffTable {
    entries: HashMap<JobId, Deferral>,
}

impl BackoffTable {
    /// True while `id` is still inside its backoff window.
    pub fn is_waiting(&self, id: JobId, now: Instant) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|d| now < d.next_eligible)
    }

    /// Record an admission denial and push the job's next attempt out.
    ///
    /// With `starved` set (no slot or proxy), returns how long the job has
    /// been starved so far. Otherwise the job is waiting on its own user's
    /// running jobs: the starvation streak ends and `None` is returned.
    pub fn defer(
        &mut self,
        id: JobId,
        now: Instant,
        base: Duration,
        max: Duration,
        starved: bool,
    ) -> Option<Duration> {
        let entry = self.entries.entry(id).or_insert(Deferral {
            deferrals: 0,
            first_denied: None,
            next_eligible: now,
        });
        entry.deferrals = entry.deferrals.saturating_add(1);
        entry.next_eligible = now + admission_backoff(entry.deferrals, base, max);
        if !starved {
            entry.first_denied = None;
            return None;
        }
        let first = *entry.first_denied.get_or_insert(now);
        Some(now.duration_since(first))
    }

    /// Hold a requeued job back for `delay`. Starts a fresh denial streak.
    pub fn retry_after(&mut self, id: JobId, now: Instant, delay: Duration) {
        self.entries.insert(
            id,
            Deferral {
                deferrals: 0,
                first_denied: None,
                next_eligible: now + delay,
            },
        );
    }

    pub fn clear(&mut self, id: JobId) {
        self.entries.remove(&id);
    }

    /// Drop entries for jobs that are no longer pending.
    pub fn retain(&mut self, pending: &HashSet<JobId>) {
        self.entries.retain(|id, _| pending.contains(id));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn deferrals_grow_and_track_first_denial() {
        let mut table = BackoffTable::default();
        let t0 = Instant::now();
        assert!(!table.is_waiting(1, t0));

        assert_eq!(table.defer(1, t0, BASE, MAX, true), Some(Duration::ZERO));
        assert!(table.is_waiting(1, t0));
        assert!(!table.is_waiting(1, t0 + BASE));

        let t1 = t0 + BASE;
        assert_eq!(table.defer(1, t1, BASE, MAX, true), Some(BASE));
        // Second denial waits twice as long.
        assert!(table.is_waiting(1, t1 + BASE));
        assert!(!table.is_waiting(1, t1 + BASE * 2));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_resets_denial_streak() {
        let mut table = BackoffTable::default();
        let t0 = Instant::now();
        table.defer(7, t0, BASE, MAX, true);
        table.retry_after(7, t0, Duration::from_secs(4));
        assert!(table.is_waiting(7, t0 + Duration::from_secs(3)));

        let later = t0 + Duration::from_secs(4);
        assert!(!table.is_waiting(7, later));
        assert_eq!(table.defer(7, later, BASE, MAX, true), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_on_own_user_backs_off_without_starving() {
        let mut table = BackoffTable::default();
        let t0 = Instant::now();
        assert_eq!(table.defer(3, t0, BASE, MAX, true), Some(Duration::ZERO));

        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(table.defer(3, t1, BASE, MAX, false), None);
        assert!(table.is_waiting(3, t1));

        // The starvation clock restarts at the next slot or proxy denial.
        let t2 = t1 + Duration::from_secs(10);
        assert_eq!(table.defer(3, t2, BASE, MAX, true), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn retain_prunes_jobs_that_left_pending() {
        let mut table = BackoffTable::default();
        let now = Instant::now();
        table.defer(1, now, BASE, MAX, true);
        table.defer(2, now, BASE, MAX, true);
        table.retain(&HashSet::from([2]));
        assert_eq!(table.len(), 1);
        assert!(!table.is_waiting(1, now));
        assert!(table.is_waiting(2, now));
        table.clear(2);
        assert_eq!(table.len(), 0);
    }
}
