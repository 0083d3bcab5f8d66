//! `clipgate submit <user> <url>` – queue a download.

use anyhow::Result;
use clipgate_core::Gateway;

pub async fn run_submit(gw: &Gateway, user: &str, url: &str, subtitles: bool) -> Result<()> {
    let submission = gw.submit(user, url, subtitles).await?;
    if submission.duplicate {
        println!(
            "Job {} already in flight for {} ({})",
            submission.job_id, user, submission.status
        );
    } else {
        println!("Submitted job {} ({})", submission.job_id, submission.status);
    }
    Ok(())
}
