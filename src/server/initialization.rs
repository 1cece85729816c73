// src/server/initialization.rs

//! Handles the complete agent initialization process: configuration
//! layering, identity resolution, and shared state construction.
//! Failures here are the only fatal path in the agent (exit code 1).

use super::context::AgentContext;
use crate::config::ConfigStore;
use crate::core::state::AgentState;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all agent components before any worker starts.
pub async fn setup(
    config: ConfigStore,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<AgentContext> {
    let agent_init = AgentState::initialize(config, log_reload_handle)
        .await
        .context("agent initialization failed")?;
    let state = agent_init.state.clone();
    info!("agent state initialized");

    log_startup_info(&state);

    Ok(AgentContext {
        state,
        background_tasks: JoinSet::new(),
        alert_rx: Some(agent_init.alert_rx),
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(state: &Arc<AgentState>) {
    let config = &state.config;
    info!(
        "monitoring {} log sources; bus subject '{}'",
        state.sources.list().len(),
        state.publisher.subject(),
    );
    info!(
        "control port {}, livelogs port {}, telemetry stream port {}",
        config.get_u64("ports.control", 8754),
        config.get_u64("ports.livelogs", 8755),
        config.get_u64("ports.telemetry_ws", 8756),
    );
    info!(
        "telemetry every {}s, heartbeat every {}s, queue cap {}",
        config.get_u64("intervals.telemetry", 3).max(1),
        config.get_u64("intervals.heartbeat", 30),
        config.get_u64("telemetry.queue_max_size", 1000),
    );
}
