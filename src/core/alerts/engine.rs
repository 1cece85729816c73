// src/core/alerts/engine.rs

//! The per-rule alert state machine and the worker that feeds it snapshots.
//!
//! Transitions per rule: under threshold resets the breach timer; over
//! threshold inside the cooldown is a no-op; a fresh breach starts the
//! timer (or fires immediately when the rule's duration is zero); once the
//! breach has been sustained for the rule's duration, the alert fires, the
//! cooldown starts, and the timer clears.

use super::{AlertEvent, AlertKind, AlertRule, AlertRuleSet, ticket_description, ticket_title};
use crate::core::metrics::MetricSnapshot;
use crate::core::state::AgentState;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Samples required before network-spike detection may emit.
const SPIKE_MIN_SAMPLES: u64 = 20;

/// Timeout for the ticket POST.
const TICKET_TIMEOUT: Duration = Duration::from_secs(5);

/// The metric values the state machine evaluates each tick.
#[derive(Debug, Clone, Default)]
pub struct AlertInputs {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: Option<f64>,
    pub net_sent_rate: f64,
    pub net_recv_rate: f64,
    pub process_count: u64,
}

impl From<&MetricSnapshot> for AlertInputs {
    fn from(snapshot: &MetricSnapshot) -> Self {
        Self {
            cpu_percent: snapshot.metrics.cpu.cpu_usage_percent,
            memory_percent: snapshot.metrics.memory.memory_usage_percent,
            disk_percent: snapshot.primary_disk().map(|d| d.usage_percent),
            net_sent_rate: snapshot.metrics.network.bytes_sent_mb_per_sec,
            net_recv_rate: snapshot.metrics.network.bytes_recv_mb_per_sec,
            process_count: snapshot.metrics.processes.process_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KindState {
    breach_started: Option<f64>,
    last_fired: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct NetworkBaseline {
    sent_total: f64,
    recv_total: f64,
    samples: u64,
}

/// The alert state machine. Confined to the engine worker; time is an
/// explicit parameter (seconds) so behavior is fully drivable in tests.
#[derive(Debug, Default)]
pub struct AlertStateMachine {
    states: HashMap<AlertKind, KindState>,
    baseline: NetworkBaseline,
}

impl AlertStateMachine {
    pub fn new() -> Self {
        Default::default()
    }

    /// Evaluates every rule against one set of inputs at time `now`.
    pub fn evaluate(
        &mut self,
        inputs: &AlertInputs,
        now: f64,
        rules: &AlertRuleSet,
    ) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        self.check_threshold(
            AlertKind::CpuCritical,
            inputs.cpu_percent,
            json!({ "cpu_percent": inputs.cpu_percent }),
            now,
            rules,
            &mut events,
        );
        self.check_threshold(
            AlertKind::CpuHigh,
            inputs.cpu_percent,
            json!({ "cpu_percent": inputs.cpu_percent }),
            now,
            rules,
            &mut events,
        );
        self.check_threshold(
            AlertKind::MemoryCritical,
            inputs.memory_percent,
            json!({ "memory_percent": inputs.memory_percent }),
            now,
            rules,
            &mut events,
        );
        self.check_threshold(
            AlertKind::MemoryHigh,
            inputs.memory_percent,
            json!({ "memory_percent": inputs.memory_percent }),
            now,
            rules,
            &mut events,
        );
        if let Some(disk_percent) = inputs.disk_percent {
            self.check_threshold(
                AlertKind::DiskCritical,
                disk_percent,
                json!({ "disk_percent": disk_percent }),
                now,
                rules,
                &mut events,
            );
            self.check_threshold(
                AlertKind::DiskHigh,
                disk_percent,
                json!({ "disk_percent": disk_percent }),
                now,
                rules,
                &mut events,
            );
        }
        self.check_threshold(
            AlertKind::HighProcessCount,
            inputs.process_count as f64,
            json!({ "process_count": inputs.process_count }),
            now,
            rules,
            &mut events,
        );
        self.check_network_spike(inputs, now, rules, &mut events);

        events
    }

    /// Evaluates one threshold rule independently of its sibling rules.
    fn check_threshold(
        &mut self,
        kind: AlertKind,
        value: f64,
        metadata: serde_json::Value,
        now: f64,
        rules: &AlertRuleSet,
        events: &mut Vec<AlertEvent>,
    ) {
        let rule = rules.get(kind);
        if value >= rule.threshold {
            if let Some(event) = self.handle_breach(kind, value, metadata, now, &rule) {
                events.push(event);
            }
        } else {
            self.reset(kind);
        }
    }

    fn check_network_spike(
        &mut self,
        inputs: &AlertInputs,
        now: f64,
        rules: &AlertRuleSet,
        events: &mut Vec<AlertEvent>,
    ) {
        self.baseline.sent_total += inputs.net_sent_rate;
        self.baseline.recv_total += inputs.net_recv_rate;
        self.baseline.samples += 1;
        if self.baseline.samples < SPIKE_MIN_SAMPLES {
            return;
        }

        let avg_sent = self.baseline.sent_total / self.baseline.samples as f64;
        let avg_recv = self.baseline.recv_total / self.baseline.samples as f64;
        let rule = rules.get(AlertKind::NetworkSpike);
        let multiplier = rule.threshold;

        let spiking = inputs.net_sent_rate > avg_sent * multiplier
            || inputs.net_recv_rate > avg_recv * multiplier;
        if spiking {
            let sent_ratio = if avg_sent > 0.0 {
                inputs.net_sent_rate / avg_sent
            } else {
                0.0
            };
            let recv_ratio = if avg_recv > 0.0 {
                inputs.net_recv_rate / avg_recv
            } else {
                0.0
            };
            let spike = sent_ratio.max(recv_ratio);
            let metadata = json!({
                "bytes_sent_mb_per_sec": inputs.net_sent_rate,
                "bytes_recv_mb_per_sec": inputs.net_recv_rate,
                "spike": spike,
            });
            if let Some(event) =
                self.handle_breach(AlertKind::NetworkSpike, spike, metadata, now, &rule)
            {
                events.push(event);
            }
        } else {
            self.reset(AlertKind::NetworkSpike);
        }
    }

    /// Applies the duration and cooldown semantics for one over-threshold
    /// observation. Returns an event when the alert fires.
    fn handle_breach(
        &mut self,
        kind: AlertKind,
        value: f64,
        metadata: serde_json::Value,
        now: f64,
        rule: &AlertRule,
    ) -> Option<AlertEvent> {
        let state = self.states.entry(kind).or_default();

        if let Some(last_fired) = state.last_fired
            && now - last_fired < rule.cooldown as f64
        {
            return None;
        }

        match state.breach_started {
            None if rule.duration == 0 => {
                state.last_fired = Some(now);
                state.breach_started = None;
                Some(AlertEvent {
                    kind,
                    value,
                    duration_secs: 0.0,
                    metadata,
                })
            }
            None => {
                state.breach_started = Some(now);
                info!("{kind} threshold breached: {value}");
                None
            }
            Some(started) => {
                let breach_duration = now - started;
                if breach_duration >= rule.duration as f64 {
                    state.last_fired = Some(now);
                    state.breach_started = None;
                    Some(AlertEvent {
                        kind,
                        value,
                        duration_secs: breach_duration,
                        metadata,
                    })
                } else {
                    None
                }
            }
        }
    }

    fn reset(&mut self, kind: AlertKind) {
        if let Some(state) = self.states.get_mut(&kind)
            && state.breach_started.take().is_some()
        {
            info!("{kind} returned to normal");
        }
    }
}

/// The worker consuming sampler output. Single-threaded over incoming
/// snapshots; ticket emission is fire-and-forget.
pub struct AlertEngineTask {
    pub state: Arc<AgentState>,
    pub rx: mpsc::Receiver<Arc<MetricSnapshot>>,
}

impl AlertEngineTask {
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "alert engine started for {} ({})",
            self.state.identity.hostname, self.state.identity.node_id
        );
        self.state
            .health
            .alert_engine
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let mut machine = AlertStateMachine::new();

        loop {
            tokio::select! {
                snapshot = self.rx.recv() => {
                    let Some(snapshot) = snapshot else {
                        debug!("alert channel closed, engine stopping");
                        return;
                    };
                    let rules = AlertRuleSet::from_config(&self.state.config);
                    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
                    let inputs = AlertInputs::from(snapshot.as_ref());
                    for event in machine.evaluate(&inputs, now, &rules) {
                        let state = self.state.clone();
                        let rule = rules.get(event.kind);
                        tokio::spawn(async move {
                            send_ticket(state, event, rule).await;
                        });
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("alert engine shutting down");
                    self.state
                        .health
                        .alert_engine
                        .store(false, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

/// POSTs one alert ticket to the control plane. Failures are logged and do
/// not affect engine state.
async fn send_ticket(state: Arc<AgentState>, event: AlertEvent, rule: AlertRule) {
    let backend = state.config.get_str("connectivity.telemetry_backend_url");
    if backend.is_empty() {
        warn!("no backend URL configured, skipping alert ticket");
        return;
    }
    let url = format!("{}/api/alerts/create", backend.trim_end_matches('/'));
    let title = ticket_title(
        event.kind,
        event.value,
        event.duration_secs,
        &state.identity.hostname,
    );
    let payload = json!({
        "title": title,
        "description": ticket_description(&event, &rule, &state.identity.hostname, &state.identity.node_id),
        "priority": rule.priority,
        "status": "open",
        "application": "System Monitor",
        "system_ip": state.identity.node_id,
        "alert_type": event.kind.to_string(),
        "metric_value": event.value,
    });

    let result = state
        .http
        .post(&url)
        .timeout(TICKET_TIMEOUT)
        .json(&payload)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            info!("ticket created for {}: {title}", event.kind);
        }
        Ok(response) => {
            warn!(
                "ticket creation failed for {}: {}",
                event.kind,
                response.status()
            );
        }
        Err(e) => warn!("ticket POST failed for {}: {e}", event.kind),
    }
}
