//! Job control for cancellation: shared abort tokens.
//!
//! The scheduler registers every dispatched job with an abort token and hands
//! the token to the worker. A cancel (from the gateway, the control socket, or
//! the scheduler noticing the job was failed externally) sets the token; the
//! worker checks it at each progress checkpoint and stops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::job_queue::JobId;

/// Shared registry of job id -> abort token.
#[derive(Debug, Default)]
pub struct JobControl {
    jobs: RwLock<HashMap<JobId, Arc<AtomicBool>>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched job; returns the abort token to pass to its worker.
    pub fn register(&self, job_id: JobId) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, Arc::clone(&token));
        token
    }

    /// Unregister a job once its worker has finished.
    pub fn unregister(&self, job_id: JobId) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }

    /// Request abort for a job. Returns false if no worker is running it.
    pub fn request_abort(&self, job_id: JobId) -> bool {
        match self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
        {
            Some(token) => {
                token.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Abort every registered job (shutdown).
    pub fn abort_all(&self) {
        for token in self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            token.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&job_id)
    }
}

/// Default path for the control socket (same XDG state dir as the DB).
pub fn default_control_socket_path() -> std::io::Result<PathBuf> {
    let dir = xdg::BaseDirectories::with_prefix("clipgate")?.get_state_home();
    Ok(dir.join("control.sock"))
}
