//! Driving loops: the long-running service loop and a drain-to-idle variant.

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::GateResult;
use crate::stats::SystemStats;
use crate::worker::WorkerEvent;

use super::{Scheduler, TickSummary};

/// Receives a stats snapshot after every admission pass.
pub type StatsSink = Box<dyn FnMut(&SystemStats) + Send + Sync>;

impl Scheduler {
    /// Tick every `poll_interval` and apply worker events as they arrive,
    /// until `shutdown` becomes true (or its sender is dropped).
    ///
    /// On shutdown every running worker is aborted. Jobs whose worker stops
    /// are left in their active state for `JobQueue::recover_in_flight`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            workers = self.workers.available(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary != TickSummary::default() => {
                            tracing::debug!(
                                dispatched = summary.dispatched,
                                deferred = summary.deferred,
                                expired = summary.expired,
                                running = self.running.len(),
                                "admission pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("admission pass failed: {}", e),
                    }
                    self.publish_stats().await;
                }
                Some(event) = self.events.recv() => self.apply(event).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        self.publish_stats().await;
        Ok(())
    }

    /// Dispatch and finish jobs until nothing is pending or running.
    ///
    /// Jobs that can never be admitted keep this looping until they hit the
    /// admission timeout.
    pub async fn run_until_idle(&mut self) -> GateResult<()> {
        loop {
            self.tick().await?;
            if self.running.is_empty() {
                let counts = self.state.queue.count_by_status().await?;
                if counts.pending == 0 {
                    return Ok(());
                }
            }

            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event).await?,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
            while let Ok(event) = self.events.try_recv() {
                self.handle_event(event).await?;
            }
        }
    }

    async fn apply(&mut self, event: WorkerEvent) {
        if let Err(e) = self.handle_event(event).await {
            tracing::error!("worker event not applied: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        if self.running.is_empty() {
            tracing::info!("scheduler stopped");
            return;
        }
        tracing::info!(running = self.running.len(), "stopping running jobs");
        self.state.control.abort_all();

        let deadline = Instant::now() + self.settings.shutdown_grace;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.apply(event).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        still_running = self.running.len(),
                        "workers did not stop within the shutdown grace period"
                    );
                    break;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    async fn publish_stats(&mut self) {
        let Some((reporter, sink)) = self.stats.as_mut() else {
            return;
        };
        match reporter.snapshot().await {
            Ok(stats) => sink(&stats),
            Err(e) => tracing::warn!("stats snapshot failed: {}", e),
        }
    }
}
