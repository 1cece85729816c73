// src/core/tasks/heartbeat.rs

//! Periodic liveness beacon to the control plane.

use crate::core::state::AgentState;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HeartbeatTask {
    state: Arc<AgentState>,
}

impl HeartbeatTask {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut restart_rx = self.state.interval_changed.subscribe();

        loop {
            let interval_secs = self.state.config.get_u64("intervals.heartbeat", 30).max(1);
            info!("heartbeat emitter started (interval: {interval_secs}s)");
            self.state
                .health
                .heartbeat
                .store(true, std::sync::atomic::Ordering::Relaxed);
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.beat().await;
                    }
                    _ = restart_rx.recv() => {
                        info!("heartbeat interval changed, restarting timer");
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("heartbeat emitter shutting down");
                        self.state.health.heartbeat.store(false, std::sync::atomic::Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }

    async fn beat(&self) {
        let backend = self.state.config.get_str("connectivity.telemetry_backend_url");
        if backend.is_empty() {
            return;
        }
        let url = format!("{}/api/heartbeat", backend.trim_end_matches('/'));
        let payload = json!({
            "node_id": self.state.identity.node_id,
            "status": "online",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        match self
            .state
            .http
            .post(&url)
            .timeout(HEARTBEAT_TIMEOUT)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => debug!("heartbeat sent"),
            Ok(response) => warn!("heartbeat rejected: {}", response.status()),
            Err(e) => warn!("heartbeat failed: {e}"),
        }
    }
}
