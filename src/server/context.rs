// src/server/context.rs

use crate::core::metrics::MetricSnapshot;
use crate::core::state::AgentState;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Everything the spawner and supervisor need to run the agent.
pub struct AgentContext {
    pub state: Arc<AgentState>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
    /// Consumed by the alert engine worker at spawn time.
    pub alert_rx: Option<mpsc::Receiver<Arc<MetricSnapshot>>>,
}
