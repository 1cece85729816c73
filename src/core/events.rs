// src/core/events.rs

//! The event types flowing between the tailers, the suppression matcher,
//! the publisher, and the live-stream taps.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Severity derived from a log line's keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Critical,
    Failure,
    Error,
    Warn,
    Info,
}

/// Priority attached to a source or derived for an event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// One accepted error line plus its derived fields, ready for bus publication.
/// Events exist only in transit; the agent never stores them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Source timestamp: the line's leading RFC3339 token, or synthesized.
    pub timestamp: String,
    pub node_id: String,
    pub hostname: String,
    /// Absolute path of the originating log file.
    pub source: String,
    pub log_label: String,
    /// The original line text, untouched.
    pub log: String,
    pub severity: Severity,
    pub priority: Priority,
    pub agent_version: String,
}

/// One line of the primary log file as pushed to live-stream peers.
#[derive(Debug, Clone, Serialize)]
pub struct LiveLogFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub node_id: String,
    pub timestamp: String,
    pub log: String,
}

impl LiveLogFrame {
    pub fn new(node_id: &str, line: &str) -> Self {
        Self {
            kind: "live_log",
            node_id: node_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            log: line.to_string(),
        }
    }
}
