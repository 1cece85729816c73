// src/core/tasks/sampler.rs

//! The periodic metric sampling worker. Every tick it collects one
//! snapshot and fans it out: the live telemetry tap, the durable queue
//! (in canonical wire form), and the alert engine.

use crate::core::state::AgentState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub struct SamplerTask {
    state: Arc<AgentState>,
}

impl SamplerTask {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut restart_rx = self.state.interval_changed.subscribe();

        // The outer loop restarts the timer when an interval change is signaled.
        loop {
            let interval_secs = self.state.config.get_u64("intervals.telemetry", 3).max(1);
            info!("metric sampler started (interval: {interval_secs}s)");
            self.state.health.sampler.store(true, std::sync::atomic::Ordering::Relaxed);
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = restart_rx.recv() => {
                        info!("sampler interval changed, restarting timer");
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("metric sampler shutting down");
                        self.state.health.sampler.store(false, std::sync::atomic::Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let snapshot = {
            let mut sampler = self.state.sampler.lock().await;
            sampler
                .sample(&self.state.identity.node_id, &self.state.identity.machine_id)
                .await
        };
        let snapshot = Arc::new(snapshot);

        // (a) live stream tap; no subscribers is fine.
        if self.state.telemetry_tap.send(snapshot.clone()).is_err() {
            debug!("no live telemetry subscribers");
        }

        // (b) durable queue, canonical wire form.
        if let Err(e) = self.state.queue.enqueue(&snapshot.to_wire()) {
            error!("failed to enqueue snapshot: {e}");
            self.state
                .report_internal_critical(format!("telemetry queue write failed: {e}"));
        }

        // (c) alert engine.
        if let Err(e) = self.state.alert_tx.send(snapshot).await {
            warn!("alert engine unavailable: {e}");
        }
    }
}
