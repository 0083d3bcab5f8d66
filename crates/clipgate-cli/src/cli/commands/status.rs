//! `clipgate status <id>` – show one job.

use anyhow::Result;
use clipgate_core::job_queue::{DownloadJob, JobId};
use clipgate_core::Gateway;

pub async fn run_status(gw: &Gateway, id: JobId, json: bool) -> Result<()> {
    let job = gw.status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

fn print_job(job: &DownloadJob) {
    println!("Job {}", job.id);
    println!("  user:      {}", job.user_id);
    println!("  url:       {}", job.source_url);
    println!("  platform:  {}", job.platform);
    println!("  subtitles: {}", if job.with_subtitles { "yes" } else { "no" });
    println!("  status:    {}", job.status);
    println!("  progress:  {}%", job.progress);
    println!("  attempts:  {}", job.attempts);
    let optional = [
        ("stage", job.stage.clone()),
        ("proxy", job.last_proxy_id.clone()),
        ("file", job.file_url.clone()),
        ("thumbnail", job.thumbnail_url.clone()),
        ("duration", job.duration_secs.map(|d| format!("{d:.1}s"))),
        ("took", job.processing_time_ms.map(|ms| format!("{ms}ms"))),
        ("last error", job.last_error.clone()),
        ("error", job.error.clone()),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            println!("  {:<10} {}", format!("{label}:"), value);
        }
    }
}
