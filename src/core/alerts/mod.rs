// src/core/alerts/mod.rs

//! Threshold alerting: the nine fixed alert kinds, their configured rules,
//! and the ticket templates sent to the control plane.

pub mod engine;

use crate::config::ConfigStore;
use crate::core::events::Priority;
use indexmap::IndexMap;
use serde_json::Value;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

pub use engine::{AlertEngineTask, AlertInputs, AlertStateMachine};

/// The fixed set of alert kinds, each tying a metric to a
/// threshold/duration/cooldown triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum AlertKind {
    CpuCritical,
    CpuHigh,
    MemoryCritical,
    MemoryHigh,
    DiskCritical,
    DiskHigh,
    NetworkSpike,
    HighProcessCount,
}

impl AlertKind {
    /// A human heading, e.g. `Cpu Critical`.
    pub fn heading(&self) -> String {
        self.to_string()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Static configuration for one alert kind. For `network_spike` the
/// threshold field holds the traffic multiplier.
#[derive(Debug, Clone, Copy)]
pub struct AlertRule {
    pub threshold: f64,
    pub duration: u64,
    pub priority: Priority,
    pub cooldown: u64,
}

/// The full rule table, rebuilt from configuration on every check so that
/// threshold changes apply hot.
#[derive(Debug, Clone)]
pub struct AlertRuleSet {
    rules: IndexMap<AlertKind, AlertRule>,
}

impl AlertRuleSet {
    pub fn from_config(config: &ConfigStore) -> Self {
        let mut rules = IndexMap::new();
        for kind in AlertKind::iter() {
            let base = format!("alerts.thresholds.{kind}");
            let threshold_key = if kind == AlertKind::NetworkSpike {
                "threshold_multiplier"
            } else {
                "threshold"
            };
            let defaults = builtin_rule(kind);
            let priority = config
                .get_opt_str(&format!("{base}.priority"))
                .and_then(|p| Priority::from_str(&p).ok())
                .unwrap_or(defaults.priority);
            rules.insert(
                kind,
                AlertRule {
                    threshold: config.get_f64(&format!("{base}.{threshold_key}"), defaults.threshold),
                    duration: config.get_u64(&format!("{base}.duration"), defaults.duration),
                    priority,
                    cooldown: config.get_u64(&format!("{base}.cooldown"), defaults.cooldown),
                },
            );
        }
        Self { rules }
    }

    pub fn get(&self, kind: AlertKind) -> AlertRule {
        self.rules
            .get(&kind)
            .copied()
            .unwrap_or_else(|| builtin_rule(kind))
    }
}

fn builtin_rule(kind: AlertKind) -> AlertRule {
    use AlertKind::*;
    use Priority::*;
    match kind {
        CpuCritical => rule(90.0, 300, Critical, 1800),
        CpuHigh => rule(75.0, 600, High, 3600),
        MemoryCritical => rule(95.0, 300, Critical, 1800),
        MemoryHigh => rule(85.0, 600, High, 3600),
        DiskCritical => rule(90.0, 0, Critical, 7200),
        DiskHigh => rule(80.0, 0, High, 14400),
        NetworkSpike => rule(5.0, 60, Medium, 1800),
        HighProcessCount => rule(500.0, 300, Medium, 3600),
    }
}

fn rule(threshold: f64, duration: u64, priority: Priority, cooldown: u64) -> AlertRule {
    AlertRule {
        threshold,
        duration,
        priority,
        cooldown,
    }
}

/// One emission produced by the state machine, ready to become a ticket.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub value: f64,
    pub duration_secs: f64,
    pub metadata: Value,
}

/// Formats the ticket title for an alert kind.
pub fn ticket_title(kind: AlertKind, value: f64, duration_secs: f64, hostname: &str) -> String {
    let value = (value * 10.0).round() / 10.0;
    let minutes = (duration_secs / 60.0 * 10.0).round() / 10.0;
    match kind {
        AlertKind::CpuCritical => {
            format!("CRITICAL: CPU usage at {value}% for {minutes} minutes on {hostname}")
        }
        AlertKind::CpuHigh => {
            format!("HIGH: CPU usage at {value}% for {minutes} minutes on {hostname}")
        }
        AlertKind::MemoryCritical => {
            format!("CRITICAL: Memory usage at {value}% for {minutes} minutes on {hostname}")
        }
        AlertKind::MemoryHigh => {
            format!("HIGH: Memory usage at {value}% for {minutes} minutes on {hostname}")
        }
        AlertKind::DiskCritical => {
            format!("CRITICAL: Disk usage at {value}% on {hostname}. Immediate action required!")
        }
        AlertKind::DiskHigh => {
            format!("WARNING: Disk usage at {value}% on {hostname}. Plan cleanup soon.")
        }
        AlertKind::NetworkSpike => {
            format!("Network traffic spike detected: {value}x normal on {hostname}")
        }
        AlertKind::HighProcessCount => {
            format!("High process count: {value} processes running on {hostname}")
        }
    }
}

/// Formats the multi-section ticket description.
pub fn ticket_description(
    event: &AlertEvent,
    rule: &AlertRule,
    hostname: &str,
    node_id: &str,
) -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
    let value = (event.value * 100.0).round() / 100.0;
    let minutes = (event.duration_secs / 60.0 * 10.0).round() / 10.0;
    let metadata = format_metadata(&event.metadata);
    format!(
        "**Alert Type:** {heading}\n\
         **Timestamp:** {timestamp}\n\
         **Host:** {hostname} ({node_id})\n\
         **Metric Value:** {value}\n\
         **Duration:** {minutes} minutes\n\
         \n\
         **Threshold Configuration:**\n\
         - Threshold: {threshold}\n\
         - Required Duration: {duration}s\n\
         - Priority: {priority}\n\
         \n\
         **Additional Metrics:**\n\
         {metadata}\n\
         \n\
         **Recommended Actions:**\n\
         {recommendations}",
        heading = event.kind.heading(),
        threshold = rule.threshold,
        duration = rule.duration,
        priority = rule.priority,
        recommendations = recommendations(event.kind),
    )
}

fn format_metadata(metadata: &Value) -> String {
    let Some(map) = metadata.as_object() else {
        return "No additional metrics".to_string();
    };
    if map.is_empty() {
        return "No additional metrics".to_string();
    }
    map.iter()
        .map(|(key, value)| format!("- {key}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn recommendations(kind: AlertKind) -> &'static str {
    use AlertKind::*;
    match kind {
        CpuCritical => "1. Check top processes: `top` or `htop`\n2. Kill unnecessary processes\n3. Consider scaling horizontally",
        CpuHigh => "1. Identify CPU-intensive processes\n2. Optimize application code\n3. Monitor trends for capacity planning",
        MemoryCritical => "1. Check for memory leaks: `ps aux --sort=-%mem`\n2. Restart leaking services\n3. Consider adding more RAM",
        MemoryHigh => "1. Clear caches: `sync; echo 3 > /proc/sys/vm/drop_caches`\n2. Review application memory usage\n3. Plan memory upgrade",
        DiskCritical => "1. Delete old logs\n2. Clear temp files\n3. Identify large files: `du -h --max-depth=1 / | sort -hr`",
        DiskHigh => "1. Run disk cleanup\n2. Archive old data\n3. Plan storage expansion",
        NetworkSpike => "1. Check active connections: `netstat -tunap`\n2. Verify no DDoS attack\n3. Review application logs",
        HighProcessCount => "1. Check for zombie processes\n2. Review application spawning logic\n3. Increase process limits if needed",
    }
}
