//! CLI for the clipgate ingestion scheduler.

mod commands;
mod control_socket;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use clipgate_core::config;
use clipgate_core::job_queue::{JobId, JobStatus};
use clipgate_core::Gateway;

use commands::{
    run_cancel, run_completions, run_list, run_manpage, run_scheduler, run_stats, run_status,
    run_submit,
};

/// Top-level CLI for clipgate.
#[derive(Debug, Parser)]
#[command(name = "clipgate")]
#[command(about = "clipgate: admission-controlled video ingestion", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Submit a video URL for download on behalf of a user.
    Submit {
        /// User the job is charged to.
        user: String,
        /// Video page URL (rumble, kick, twitch, google drive, zoom clips).
        url: String,
        /// Burn subtitles into the downloaded video.
        #[arg(long)]
        subtitles: bool,
    },

    /// Show one job in detail.
    Status {
        /// Job identifier.
        id: JobId,
        /// Print the job record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List jobs, newest first.
    List {
        /// Only jobs in this status (pending, admitted, downloading, processing, completed, failed).
        #[arg(long, value_name = "STATUS")]
        status: Option<JobStatus>,
    },

    /// Show slot, proxy, queue and per-user statistics.
    Stats {
        /// Print the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Cancel a job. A running download is stopped.
    Cancel {
        /// Job identifier.
        id: JobId,
    },

    /// Run the scheduler and workers until interrupted.
    Run {
        /// Exit once nothing is pending or running.
        #[arg(long)]
        once: bool,
    },

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Print the man page (roff) to stdout.
    Manpage,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        // These never touch config or the queue.
        match cli.command {
            CliCommand::Completions { shell } => return run_completions(Cli::command(), shell),
            CliCommand::Manpage => return run_manpage(Cli::command()),
            _ => {}
        }

        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let gateway = Gateway::open(&cfg).await?;

        match cli.command {
            CliCommand::Submit {
                user,
                url,
                subtitles,
            } => run_submit(&gateway, &user, &url, subtitles).await?,
            CliCommand::Status { id, json } => run_status(&gateway, id, json).await?,
            CliCommand::List { status } => run_list(&gateway, status).await?,
            CliCommand::Stats { json } => run_stats(&gateway, json).await?,
            CliCommand::Cancel { id } => run_cancel(&gateway, id).await?,
            CliCommand::Run { once } => run_scheduler(&gateway, &cfg, once).await?,
            CliCommand::Completions { .. } | CliCommand::Manpage => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
