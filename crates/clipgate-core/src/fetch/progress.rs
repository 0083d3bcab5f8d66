//! Progress checkpoints shared by the fetch, subtitle and upload steps.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::job_queue::JobId;
use crate::worker::WorkerEvent;

use super::FetchError;

/// Highest value a worker reports; 100 is written only on completion.
const MAX_REPORTED: u8 = 99;

/// Maps a step's own 0–100 progress into its slice of the job's progress and
/// forwards it to the scheduler.
///
/// Every call is also a cancellation checkpoint: once the job's abort token
/// is set, `report`/`stage`/`check` return [`FetchError::Cancelled`].
/// Reported values never decrease, across all scoped copies of a reporter.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    abort: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    start: u8,
    end: u8,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(
        job_id: JobId,
        abort: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            job_id,
            abort,
            events: Some(events),
            start: 0,
            end: MAX_REPORTED,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Reporter that only checks the abort token (nothing is forwarded).
    pub fn detached(job_id: JobId, abort: Arc<AtomicBool>) -> Self {
        Self {
            job_id,
            abort,
            events: None,
            start: 0,
            end: MAX_REPORTED,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Reporter whose 0–100 maps onto `start..=end` of the job's progress.
    pub fn scoped(&self, start: u8, end: u8) -> Self {
        let end = end.min(MAX_REPORTED);
        Self {
            start: start.min(end),
            end,
            ..self.clone()
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Cancellation checkpoint without a progress value.
    pub fn check(&self) -> Result<(), FetchError> {
        if self.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok(())
    }

    /// Highest job-level progress reported so far.
    pub fn current(&self) -> u8 {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Job-level value for step progress `percent` (0–100).
    fn map(&self, percent: f64) -> u8 {
        let fraction = if percent.is_finite() {
            (percent / 100.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let span = f64::from(self.end - self.start);
        self.start + (span * fraction).floor() as u8
    }

    /// Report step progress (0–100). Only increases are forwarded.
    pub fn report(&self, percent: f64) -> Result<(), FetchError> {
        self.check()?;
        let value = self.map(percent);
        let previous = self.high_water.fetch_max(value, Ordering::Relaxed);
        if value > previous {
            self.send(WorkerEvent::Progress {
                job_id: self.job_id,
                percent: value,
                stage: None,
            });
        }
        Ok(())
    }

    /// Announce a new human-readable stage at the current progress.
    pub fn stage(&self, stage: &str) -> Result<(), FetchError> {
        self.check()?;
        let floor = self.high_water.fetch_max(self.start, Ordering::Relaxed).max(self.start);
        self.send(WorkerEvent::Progress {
            job_id: self.job_id,
            percent: floor,
            stage: Some(stage.to_string()),
        });
        Ok(())
    }

    pub(crate) fn send(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            // Scheduler gone means shutdown; nothing left to tell.
            let _ = tx.send(event);
        }
    }
}
