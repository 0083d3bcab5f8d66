//! Retry and backoff policy.
//!
//! Error classification for fetch-tool failures and the pure backoff
//! functions used by the scheduler: retry backoff after a transient fetch
//! error, and admission backoff for jobs that could not be admitted yet.

mod classify;
mod policy;

pub use classify::{classify_exit, classify_http_status, classify_tool_output};
pub use policy::{admission_backoff, exponential_backoff, ErrorKind, RetryDecision, RetryPolicy};
