//! Durable job queue (SQLite via sqlx).
//!
//! Single source of truth for job status. Every status change goes through
//! [`JobQueue::transition`] (or `requeue`), which checks the lifecycle edge
//! and compare-and-sets the stored status, then emits a [`JobEvent`].

mod db;
mod jobs;
mod types;

pub(crate) use db::unix_timestamp;
pub use db::JobQueue;
pub use types::*;
