// src/core/tasks/telemetry_flush.rs

//! Drains the telemetry queue: every cycle, dequeue a small batch and POST
//! each snapshot, classifying failures. Transient failures wait out an
//! incrementing backoff before the next attempt; client errors drop the
//! entry immediately.

use crate::core::state::AgentState;
use crate::core::telemetry::{PostOutcome, TelemetryPoster};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub struct TelemetryFlushTask {
    state: Arc<AgentState>,
}

impl TelemetryFlushTask {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let config = &self.state.config;
        let flush_interval = config.get_u64("telemetry.post_interval", 60).max(1);
        info!("telemetry flush worker started (interval: {flush_interval}s)");
        self.state
            .health
            .poster
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let mut interval = tokio::time::interval(Duration::from_secs(flush_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.flush_cycle(&mut shutdown_rx).await {
                        return;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("telemetry flush worker shutting down");
                    self.state.health.poster.store(false, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    /// Posts one batch. Returns true when shutdown arrived mid-cycle.
    async fn flush_cycle(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        let config = &self.state.config;
        if self.state.queue.is_empty() {
            return false;
        }

        let batch_size = config.get_u64("telemetry.post_batch_size", 10);
        let max_retries = config.get_u64("telemetry.max_retries", 3) as u32;
        let backoff: Vec<u64> = config
            .get("telemetry.retry_backoff")
            .and_then(|v| v.as_array().cloned())
            .map(|arr| arr.iter().filter_map(|v| v.as_u64()).collect())
            .filter(|series: &Vec<u64>| !series.is_empty())
            .unwrap_or_else(|| vec![5, 15, 60]);

        let poster = TelemetryPoster::new(
            self.state.http.clone(),
            &config.get_str("connectivity.telemetry_backend_url"),
            config.get_secret("telemetry_token"),
            Duration::from_secs(config.get_u64("telemetry.timeout", 10)),
        );

        let entries = match self.state.queue.dequeue(batch_size) {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to dequeue snapshots: {e}");
                return false;
            }
        };
        debug!("flushing {} queued snapshots", entries.len());

        for entry in entries {
            match poster.post_snapshot(&entry.payload).await {
                PostOutcome::Sent => {
                    if let Err(e) = self.state.queue.mark_sent(entry.id) {
                        error!("failed to remove sent snapshot {}: {e}", entry.id);
                    }
                }
                PostOutcome::ClientError(status) => {
                    // Structurally rejected; retrying cannot help.
                    error!(
                        "dropping snapshot {} (client error {status})",
                        entry.id
                    );
                    if let Err(e) = self.state.queue.mark_sent(entry.id) {
                        error!("failed to remove rejected snapshot {}: {e}", entry.id);
                    }
                }
                PostOutcome::Transient(reason) => {
                    debug!("snapshot {} failed transiently: {reason}", entry.id);
                    match self.state.queue.mark_failed(entry.id, max_retries) {
                        Ok(still_queued) => {
                            if still_queued {
                                let wait = backoff
                                    [usize::min(entry.retry_count as usize, backoff.len() - 1)];
                                info!(
                                    "retrying snapshot {} next cycle; backing off {wait}s",
                                    entry.id
                                );
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                                    _ = shutdown_rx.recv() => return true,
                                }
                            }
                        }
                        Err(e) => error!("failed to mark snapshot {} failed: {e}", entry.id),
                    }
                }
            }
        }
        false
    }
}
