// src/core/telemetry/poster.rs

//! HTTP POST client for telemetry snapshots, with error classification.
//!
//! Client errors (4xx) mean the snapshot is structurally rejected and no
//! retry will help; transient errors (5xx, connection refused, timeout, DNS)
//! leave the entry in the queue for the next cycle.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The outcome of a single snapshot POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Sent,
    /// 4xx: drop the snapshot, retrying cannot succeed.
    ClientError(u16),
    /// 5xx or a transport failure: retry on a later cycle.
    Transient(String),
}

/// POST client for the snapshot endpoint. Reuses the shared agent HTTP
/// client, so TCP connections are pooled across cycles.
#[derive(Debug, Clone)]
pub struct TelemetryPoster {
    http: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl TelemetryPoster {
    pub fn new(
        http: reqwest::Client,
        backend_url: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        let endpoint = format!(
            "{}/api/telemetry/snapshot",
            backend_url.trim_end_matches('/')
        );
        info!(
            "telemetry poster initialized (endpoint={endpoint}, timeout={}s)",
            timeout.as_secs()
        );
        Self {
            http,
            endpoint,
            bearer_token,
            timeout,
        }
    }

    /// POSTs one snapshot and classifies the result.
    pub async fn post_snapshot(&self, payload: &Value) -> PostOutcome {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(payload);
        if let Some(token) = &self.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("snapshot POST timed out after {}s", self.timeout.as_secs());
                return PostOutcome::Transient("timeout".to_string());
            }
            Err(e) if e.is_connect() => {
                warn!("snapshot endpoint unavailable (connection error)");
                return PostOutcome::Transient("connection_error".to_string());
            }
            Err(e) => {
                error!("snapshot POST request error: {e}");
                return PostOutcome::Transient(e.to_string());
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!("successfully posted snapshot");
            PostOutcome::Sent
        } else if status.is_client_error() {
            let detail = response
                .text()
                .await
                .map(|body| body.chars().take(100).collect::<String>())
                .unwrap_or_default();
            error!("snapshot rejected by backend: {} - {detail}", status.as_u16());
            PostOutcome::ClientError(status.as_u16())
        } else {
            warn!("snapshot endpoint server error: {}", status.as_u16());
            PostOutcome::Transient(format!("server_error_{}", status.as_u16()))
        }
    }
}
