//! Error taxonomy shared by the admission, queue and scheduling layers.
//!
//! Admission denials (`RateLimited`, `ConcurrencyExceeded`, `SlotUnavailable`,
//! `ProxyUnavailable`) are expected, non-fatal outcomes. `InvalidTransition`
//! indicates a bug in a caller and is logged at `error` wherever it surfaces.

use std::time::Duration;

use crate::admission::AdmissionDenied;
use crate::job_queue::{JobId, JobStatus};
use crate::platform::Platform;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("rate limited: at most {limit} submissions per window (retry in {}s)", retry_after.as_secs())]
    RateLimited { limit: u32, retry_after: Duration },

    #[error("concurrency exceeded: at most {limit} active jobs per user")]
    ConcurrencyExceeded { limit: usize },

    #[error("no free download slot for {0}")]
    SlotUnavailable(Platform),

    #[error("no healthy proxy available")]
    ProxyUnavailable,

    #[error("job waited {waited:.1?} for admission and was given up")]
    AdmissionTimeout { waited: Duration },

    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    #[error("permanent fetch error: {0}")]
    PermanentFetch(String),

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("corrupt job record {job_id}: {detail}")]
    CorruptRecord { job_id: JobId, detail: String },

    #[error("job store: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<AdmissionDenied> for GateError {
    fn from(denied: AdmissionDenied) -> Self {
        match denied {
            AdmissionDenied::RateLimited { limit, retry_after } => {
                GateError::RateLimited { limit, retry_after }
            }
            AdmissionDenied::ConcurrencyExceeded { limit } => {
                GateError::ConcurrencyExceeded { limit }
            }
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
