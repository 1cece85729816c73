// src/core/publisher.rs

//! Publishes accepted error events to the durable message bus.
//!
//! The connection is built lazily and reused across publishes. A failed
//! publish rebuilds the connection once and retries; a second failure drops
//! the event and logs it. Delivery is at-least-once on the stream's
//! durability: the publish ack is awaited before an event counts as sent.

use crate::core::errors::AgentError;
use crate::core::events::{LogEvent, Priority, Severity};
use async_nats::jetstream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub subject: String,
}

/// The bus publisher shared by all tailer workers.
pub struct EventPublisher {
    config: BusConfig,
    context: Mutex<Option<jetstream::Context>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            context: Mutex::new(None),
        }
    }

    pub fn subject(&self) -> &str {
        &self.config.subject
    }

    /// Publishes one event, best-effort. Returns an error only after the
    /// single reconnect-and-retry has also failed; callers log and drop.
    pub async fn publish(&self, event: &LogEvent) -> Result<(), AgentError> {
        let payload = serde_json::to_vec(event)?;

        match self.try_publish(payload.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("bus publish failed ({first}), rebuilding connection");
                self.reset().await;
                self.try_publish(payload).await.map_err(|e| {
                    error!(
                        "bus publish failed after reconnect, dropping event from {}: {e}",
                        event.source
                    );
                    e
                })
            }
        }
    }

    /// Forwards a critical agent-internal diagnostic through the same bus
    /// path, labeled as agent output.
    pub async fn publish_internal(&self, node_id: &str, hostname: &str, message: &str) {
        let event = LogEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            node_id: node_id.to_string(),
            hostname: hostname.to_string(),
            source: "agent".to_string(),
            log_label: "agent_internal".to_string(),
            log: message.to_string(),
            severity: Severity::Critical,
            priority: Priority::Critical,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Err(e) = self.publish(&event).await {
            error!("failed to forward internal diagnostic: {e}");
        }
    }

    async fn try_publish(&self, payload: Vec<u8>) -> Result<(), AgentError> {
        let context = self.ensure_connected().await?;
        let ack = context
            .publish(self.config.subject.clone(), payload.into())
            .await
            .map_err(|e| AgentError::Bus(e.to_string()))?;
        ack.await.map_err(|e| AgentError::Bus(e.to_string()))?;
        debug!("published event to {}", self.config.subject);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<jetstream::Context, AgentError> {
        let mut slot = self.context.lock().await;
        if let Some(context) = slot.as_ref() {
            return Ok(context.clone());
        }
        let client = async_nats::connect(&self.config.url)
            .await
            .map_err(|e| AgentError::Bus(format!("connect to {} failed: {e}", self.config.url)))?;
        info!("connected to message bus at {}", self.config.url);
        let context = jetstream::new(client);
        *slot = Some(context.clone());
        Ok(context)
    }

    async fn reset(&self) {
        *self.context.lock().await = None;
    }
}
