// src/server/spawner.rs

//! Spawns all of the agent's long-running workers.

use super::context::AgentContext;
use super::control_api;
use crate::core::alerts::AlertEngineTask;
use crate::core::live::{log_stream, telemetry_stream};
use crate::core::sources::{LogSource, TailerHandle};
use crate::core::state::AgentState;
use crate::core::tailer::TailerTask;
use crate::core::tasks::{
    heartbeat::HeartbeatTask, sampler::SamplerTask, telemetry_flush::TelemetryFlushTask,
};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Spawns all workers into the context's JoinSet (or, for tailers and live
/// servers, as independently stoppable tasks).
pub async fn spawn_all(ctx: &mut AgentContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &state.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Tailer per enabled source ---
    for source in state.sources.list() {
        spawn_tailer(state, source);
    }
    state.health.tailers.store(true, Ordering::Relaxed);

    // --- Metric sampler ---
    let sampler = SamplerTask::new(state.clone());
    let shutdown_rx_sampler = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        sampler.run(shutdown_rx_sampler).await;
        Ok(())
    });

    // --- Alert engine ---
    let alert_rx = ctx
        .alert_rx
        .take()
        .ok_or_else(|| anyhow!("alert receiver must exist at spawn time"))?;
    let engine = AlertEngineTask {
        state: state.clone(),
        rx: alert_rx,
    };
    let shutdown_rx_alerts = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        engine.run(shutdown_rx_alerts).await;
        Ok(())
    });

    // --- Telemetry queue flush ---
    let flush = TelemetryFlushTask::new(state.clone());
    let shutdown_rx_flush = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        flush.run(shutdown_rx_flush).await;
        Ok(())
    });

    // --- Heartbeat ---
    let heartbeat = HeartbeatTask::new(state.clone());
    let shutdown_rx_heartbeat = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        heartbeat.run(shutdown_rx_heartbeat).await;
        Ok(())
    });

    // --- Control API ---
    let control_state = state.clone();
    let shutdown_rx_control = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        control_api::run_control_server(control_state, shutdown_rx_control).await;
        Ok(())
    });

    // --- Live-stream servers ---
    if let Err(e) = log_stream::start(state.clone()).await {
        warn!("live log stream unavailable: {e}");
    }
    if let Err(e) = telemetry_stream::start(state.clone()).await {
        warn!("telemetry stream unavailable: {e}");
    }

    info!("all workers have been spawned");
    Ok(())
}

/// Spawns one tailer worker and registers its stop handle. Shared with the
/// control API for sources added at runtime.
pub fn spawn_tailer(state: &Arc<AgentState>, source: LogSource) {
    if state.sources.has_handle(&source.id) {
        return;
    }
    let (stop_tx, stop_rx) = broadcast::channel(1);
    state
        .sources
        .register_handle(&source.id, TailerHandle { stop_tx });
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task = TailerTask::new(state.clone(), source);
    tokio::spawn(async move {
        task.run(shutdown_rx, stop_rx).await;
    });
}
