//! `clipgate list` – list jobs.

use anyhow::Result;
use clipgate_core::job_queue::JobStatus;
use clipgate_core::Gateway;

pub async fn run_list(gw: &Gateway, status: Option<JobStatus>) -> Result<()> {
    let jobs = gw.list(status).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<6} {:<12} {:<5} {:<13} {:<12} {}",
        "ID", "STATUS", "PCT", "PLATFORM", "USER", "URL"
    );
    for j in jobs {
        println!(
            "{:<6} {:<12} {:<5} {:<13} {:<12} {}",
            j.id,
            j.status.as_str(),
            format!("{}%", j.progress),
            j.platform.as_str(),
            j.user_id,
            j.source_url
        );
    }
    Ok(())
}
