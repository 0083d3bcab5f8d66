//! Admission-controlled video ingestion: a durable job queue, per-user quotas,
//! per-platform download slots, a health-tracked proxy pool and the scheduler
//! that ties them to a bounded pool of fetch workers.

pub mod admission;
pub mod config;
pub mod control;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod job_queue;
pub mod logging;
pub mod platform;
pub mod proxy_pool;
pub mod retry;
pub mod scheduler;
pub mod slots;
pub mod stats;
pub mod worker;

pub use error::{GateError, GateResult};
pub use gateway::{Gateway, Submission};
