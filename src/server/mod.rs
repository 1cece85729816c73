// src/server/mod.rs

use crate::config::ConfigStore;
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
pub mod control_api;
mod initialization;
mod spawner;
mod supervisor;

pub use context::AgentContext;

/// The main agent startup function, orchestrating all setup phases.
pub async fn run(
    config: ConfigStore,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Initialize shared state, storage, and identity.
    let mut agent_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn all workers.
    spawner::spawn_all(&mut agent_context).await?;

    // 3. Supervise until a shutdown signal, then drain gracefully.
    supervisor::run(agent_context).await;

    Ok(())
}
