// src/core/sources.rs

//! The registry of monitored log sources and their running tailer handles.

use crate::config::ConfigStore;
use crate::core::classify::derive_label;
use crate::core::errors::AgentError;
use crate::core::events::Priority;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// A monitored log file. The auto-monitor source (the agent's own log file)
/// is always present and can never be removed or disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSource {
    pub id: String,
    pub path: String,
    pub label: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_monitor: bool,
    #[serde(default = "now_rfc3339")]
    pub created_at: String,
    #[serde(default = "now_rfc3339")]
    pub modified_at: String,
}

fn default_enabled() -> bool {
    true
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl LogSource {
    pub fn new(path: &str, label: Option<String>, priority: Priority) -> Self {
        let now = now_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.unwrap_or_else(|| derive_label(path)),
            path: path.to_string(),
            priority,
            enabled: true,
            auto_monitor: false,
            created_at: now.clone(),
            modified_at: now,
        }
    }

    /// The always-present source covering the agent's own log file.
    pub fn auto_monitor(path: &str) -> Self {
        let now = now_rfc3339();
        Self {
            id: "agent-internal".to_string(),
            label: "agent_internal".to_string(),
            path: path.to_string(),
            priority: Priority::High,
            enabled: true,
            auto_monitor: true,
            created_at: now.clone(),
            modified_at: now,
        }
    }
}

/// Runtime handle for a source's tailer: the stop signal for its worker.
#[derive(Debug)]
pub struct TailerHandle {
    pub stop_tx: broadcast::Sender<()>,
}

/// Registry of sources, keyed by source id. Tailer stop senders live next to
/// the source definitions so removal can signal the matching worker.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: DashMap<String, LogSource>,
    handles: DashMap<String, TailerHandle>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Seeds the registry from `monitoring.log_files` plus the auto-monitor
    /// source for the agent's own log file.
    pub fn seed_from_config(&self, config: &ConfigStore, agent_log_path: &str) {
        self.sources.clear();
        let auto = LogSource::auto_monitor(agent_log_path);
        self.sources.insert(auto.id.clone(), auto);

        if let Some(entries) = config.get("monitoring.log_files").and_then(|v| v.as_array().cloned()) {
            for entry in entries {
                match serde_json::from_value::<LogSource>(entry.clone()) {
                    Ok(source) if !source.auto_monitor => {
                        self.sources.insert(source.id.clone(), source);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Tolerate the short form: a bare path string.
                        if let Some(path) = entry.as_str() {
                            let source = LogSource::new(path, None, Priority::Medium);
                            self.sources.insert(source.id.clone(), source);
                        } else {
                            tracing::warn!("skipping malformed log source entry: {e}");
                        }
                    }
                }
            }
        }
        info!("source registry seeded with {} sources", self.sources.len());
    }

    /// Writes the non-auto sources back to the config tree and saves it.
    pub fn persist_to_config(&self, config: &ConfigStore) -> Result<(), AgentError> {
        let list: Vec<serde_json::Value> = self
            .sources
            .iter()
            .filter(|e| !e.auto_monitor)
            .map(|e| json!(e.value()))
            .collect();
        config.set("monitoring.log_files", json!(list));
        config.save()
    }

    pub fn add(&self, source: LogSource) -> LogSource {
        self.sources.insert(source.id.clone(), source.clone());
        source
    }

    pub fn get(&self, id: &str) -> Option<LogSource> {
        self.sources.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<LogSource> {
        let mut all: Vec<LogSource> = self.sources.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.sources.get(id).map(|e| e.enabled).unwrap_or(false)
    }

    /// Updates mutable fields of a source. Disabling the auto-monitor source
    /// is rejected.
    pub fn update(
        &self,
        id: &str,
        enabled: Option<bool>,
        label: Option<String>,
        priority: Option<Priority>,
    ) -> Result<LogSource, AgentError> {
        let mut entry = self
            .sources
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(format!("no such source: {id}")))?;
        if entry.auto_monitor && enabled == Some(false) {
            return Err(AgentError::InvalidRequest(
                "the agent's own log source cannot be disabled".to_string(),
            ));
        }
        if let Some(enabled) = enabled {
            entry.enabled = enabled;
        }
        if let Some(label) = label {
            entry.label = label;
        }
        if let Some(priority) = priority {
            entry.priority = priority;
        }
        entry.modified_at = now_rfc3339();
        Ok(entry.value().clone())
    }

    /// Removes a source and signals its tailer to stop. The auto-monitor
    /// source is never removable.
    pub fn remove(&self, id: &str) -> Result<LogSource, AgentError> {
        {
            let entry = self
                .sources
                .get(id)
                .ok_or_else(|| AgentError::NotFound(format!("no such source: {id}")))?;
            if entry.auto_monitor {
                return Err(AgentError::InvalidRequest(
                    "the agent's own log source cannot be removed".to_string(),
                ));
            }
        }
        let (_, source) = self
            .sources
            .remove(id)
            .ok_or_else(|| AgentError::NotFound(format!("no such source: {id}")))?;
        if let Some((_, handle)) = self.handles.remove(id) {
            let _ = handle.stop_tx.send(());
        }
        info!("removed log source {} ({})", source.id, source.path);
        Ok(source)
    }

    pub fn register_handle(&self, id: &str, handle: TailerHandle) {
        self.handles.insert(id.to_string(), handle);
    }

    pub fn has_handle(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    /// Signals every tailer to stop and clears the handle table.
    pub fn stop_all(&self) {
        for entry in self.handles.iter() {
            let _ = entry.stop_tx.send(());
        }
        self.handles.clear();
    }
}
