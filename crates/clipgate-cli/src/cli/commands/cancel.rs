//! `clipgate cancel <id>` – fail a job. If `clipgate run` is active, tells it to stop the worker.

use anyhow::Result;
use clipgate_core::control::default_control_socket_path;
use clipgate_core::job_queue::JobId;
use clipgate_core::Gateway;

use crate::cli::control_socket;

pub async fn run_cancel(gw: &Gateway, id: JobId) -> Result<()> {
    gw.cancel(id).await?;
    if let Ok(path) = default_control_socket_path() {
        if let Err(e) = control_socket::send_cancel(&path, id).await {
            // The run loop still notices on the job's next progress update.
            tracing::debug!(job_id = id, "control socket unavailable: {}", e);
        }
    }
    println!("Cancelled job {id}");
    Ok(())
}
