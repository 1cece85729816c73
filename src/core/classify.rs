// src/core/classify.rs

//! Per-line classification: severity and priority keyword derivation, the
//! label-from-path heuristic, the error-keyword emission gate, the self-loop
//! guard, and timestamp extraction.

use crate::core::errors::AgentError;
use crate::core::events::{Priority, Severity};
use chrono::DateTime;
use regex::{Regex, RegexBuilder};
use std::path::Path;

/// Prefixes of the agent's own diagnostic output. Lines carrying one of these
/// are skipped before classification so tailing a file that contains agent
/// output cannot feed the agent's errors back into itself.
pub const INTERNAL_MARKERS: &[&str] = &[
    "vigild::core::publisher",
    "vigild::core::telemetry",
    "vigild::core::suppression",
    "vigild::core::live",
];

/// Returns true when the line originates from the agent's own diagnostics.
pub fn is_internal_line(line: &str) -> bool {
    INTERNAL_MARKERS.iter().any(|marker| line.contains(marker))
}

/// The compiled per-line matchers, rebuilt whenever the monitoring keyword
/// configuration changes.
#[derive(Debug)]
pub struct LineMatchers {
    error_gate: Regex,
    critical_keywords: Vec<String>,
    high_keywords: Vec<String>,
}

impl LineMatchers {
    pub fn new(
        error_keywords: &[String],
        critical_keywords: &[String],
        high_keywords: &[String],
    ) -> Result<Self, AgentError> {
        let pattern = error_keywords
            .iter()
            .map(|kw| regex::escape(kw))
            .collect::<Vec<_>>()
            .join("|");
        let error_gate = RegexBuilder::new(&format!("(?:{pattern})"))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            error_gate,
            critical_keywords: lowered(critical_keywords),
            high_keywords: lowered(high_keywords),
        })
    }

    /// The emission gate: only lines matching the error-keyword set flow on.
    pub fn is_error_line(&self, line: &str) -> bool {
        self.error_gate.is_match(line)
    }

    /// Derives priority for a line, overriding the severity mapping when a
    /// critical- or high-priority keyword is present.
    pub fn derive_priority(&self, line: &str, severity: Severity) -> Priority {
        let lower = line.to_lowercase();
        if self.critical_keywords.iter().any(|kw| lower.contains(kw)) {
            return Priority::Critical;
        }
        if self.high_keywords.iter().any(|kw| lower.contains(kw)) {
            return Priority::High;
        }
        match severity {
            Severity::Critical => Priority::Critical,
            Severity::Error | Severity::Failure => Priority::High,
            Severity::Warn => Priority::Medium,
            Severity::Info => Priority::Low,
        }
    }
}

fn lowered(keywords: &[String]) -> Vec<String> {
    keywords.iter().map(|kw| kw.to_lowercase()).collect()
}

/// Derives severity from a line by keyword containment, most severe first.
pub fn derive_severity(line: &str) -> Severity {
    let lower = line.to_lowercase();
    if ["panic", "fatal", "critical", "crit"].iter().any(|kw| lower.contains(kw)) {
        Severity::Critical
    } else if lower.contains("fail") {
        Severity::Failure
    } else if lower.contains("err") {
        Severity::Error
    } else if lower.contains("warn") {
        Severity::Warn
    } else {
        Severity::Info
    }
}

/// Derives a human label from a log file path by substring heuristic,
/// falling back to the basename without its extension.
pub fn derive_label(path: &str) -> String {
    let lower = path.to_lowercase();
    if lower.contains("apache") {
        return "apache_errors".to_string();
    }
    if lower.contains("nginx") {
        return "nginx_errors".to_string();
    }
    if lower.contains("mysql") || lower.contains("mariadb") {
        return "mysql_errors".to_string();
    }
    if lower.contains("postgres") {
        return "postgresql_errors".to_string();
    }
    if lower.contains("syslog") || lower.contains("messages") {
        return "system".to_string();
    }
    if lower.contains("kern") {
        return "kernel".to_string();
    }
    if lower.contains("auth") {
        return "authentication".to_string();
    }
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Extracts a leading RFC3339 timestamp from the line, or synthesizes one.
pub fn extract_timestamp(line: &str) -> String {
    if let Some(token) = line.split_whitespace().next()
        && DateTime::parse_from_rfc3339(token).is_ok()
    {
        return token.to_string();
    }
    chrono::Utc::now().to_rfc3339()
}
