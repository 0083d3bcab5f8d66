//! `clipgate run` – recover interrupted jobs, then schedule until Ctrl-C (or idle with `--once`).

use std::sync::Arc;

use anyhow::Result;
use clipgate_core::config::GateConfig;
use clipgate_core::control::default_control_socket_path;
use clipgate_core::job_queue::JobStatus;
use clipgate_core::scheduler::SchedulerSettings;
use clipgate_core::stats::{default_stats_path, write_stats_file, SystemStats};
use clipgate_core::worker::{Collaborators, WorkerSettings};
use clipgate_core::Gateway;
use tokio::sync::watch;

use crate::cli::control_socket;

pub async fn run_scheduler(gw: &Gateway, cfg: &GateConfig, once: bool) -> Result<()> {
    let recovered = gw.queue().recover_in_flight().await?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued jobs interrupted by a previous run");
    }
    if cfg.proxies.is_empty() {
        tracing::warn!("no proxies configured; jobs will wait until the admission timeout");
    }

    let collaborators = Collaborators::from_config(cfg)?;
    let worker_settings = WorkerSettings::from_config(cfg)?;
    let settings = SchedulerSettings::from_config(cfg);
    let counter = gw.stats_reporter().spawn_event_counter();

    let listener = match default_control_socket_path() {
        Ok(path) => Some(control_socket::spawn_control_listener(
            Arc::clone(&gw.state().control),
            path,
        )?),
        Err(e) => {
            tracing::warn!("control socket unavailable: {}", e);
            None
        }
    };

    let mut scheduler = gw.scheduler(collaborators, worker_settings, settings);
    let result = if once {
        scheduler.run_until_idle().await.map_err(anyhow::Error::from)
    } else {
        let stats_path = default_stats_path()?;
        let sink = move |stats: &SystemStats| {
            if let Err(e) = write_stats_file(&stats_path, stats) {
                tracing::warn!("stats file not written: {:#}", e);
            }
        };
        let mut scheduler = scheduler.with_stats_sink(gw.stats_reporter(), Box::new(sink));

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                let _ = tx.send(true);
            } else {
                // Without a signal handler, keep the sender alive so the loop runs on.
                std::future::pending::<()>().await;
            }
        });
        scheduler.run(rx).await
    };

    if let Some(listener) = listener {
        listener.abort();
    }
    counter.abort();
    result?;

    let counts = gw.queue().count_by_status().await?;
    println!(
        "Scheduler stopped: {} completed, {} failed, {} pending, {} active.",
        counts.get(JobStatus::Completed),
        counts.get(JobStatus::Failed),
        counts.get(JobStatus::Pending),
        counts.active()
    );
    Ok(())
}
