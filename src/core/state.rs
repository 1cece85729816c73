// src/core/state.rs

//! Defines the central `AgentState` struct, holding all shared agent-wide state.

use crate::config::ConfigStore;
use crate::core::classify::LineMatchers;
use crate::core::errors::AgentError;
use crate::core::events::LiveLogFrame;
use crate::core::live::{PeerRegistry, StreamControl};
use crate::core::metrics::{MetricSampler, MetricSnapshot, ProcessMonitor};
use crate::core::publisher::{BusConfig, EventPublisher};
use crate::core::sources::SourceRegistry;
use crate::core::suppression::{RuleStore, SuppressionChecker};
use crate::core::telemetry::TelemetryQueue;
use indexmap::IndexMap;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};
use uuid::Uuid;

/// Capacity of the live log tap. Slow stream servers lag rather than grow.
const LOG_TAP_CAPACITY: usize = 256;

/// Capacity of the telemetry tap.
const TELEMETRY_TAP_CAPACITY: usize = 64;

/// Capacity of the sampler → alert engine channel.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Contains the initialized state plus the channel ends consumed by the
/// spawner. Created once during initialization.
pub struct AgentInit {
    pub state: Arc<AgentState>,
    /// Receives snapshots for the alert engine worker.
    pub alert_rx: mpsc::Receiver<Arc<MetricSnapshot>>,
}

/// The node's resolved identity, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub machine_id: String,
    pub hostname: String,
    pub version: &'static str,
    pub started_at: Instant,
}

/// Liveness flags for the always-on workers, surfaced by `/health`.
#[derive(Debug, Default)]
pub struct ComponentHealth {
    pub tailers: AtomicBool,
    pub sampler: AtomicBool,
    pub alert_engine: AtomicBool,
    pub poster: AtomicBool,
    pub heartbeat: AtomicBool,
    pub control_api: AtomicBool,
}

impl ComponentHealth {
    pub fn snapshot(&self) -> IndexMap<&'static str, bool> {
        IndexMap::from([
            ("tailers", self.tailers.load(Ordering::Relaxed)),
            ("sampler", self.sampler.load(Ordering::Relaxed)),
            ("alert_engine", self.alert_engine.load(Ordering::Relaxed)),
            ("poster", self.poster.load(Ordering::Relaxed)),
            ("heartbeat", self.heartbeat.load(Ordering::Relaxed)),
            ("control_api", self.control_api.load(Ordering::Relaxed)),
        ])
    }

    pub fn all_running(&self) -> bool {
        self.snapshot().values().all(|running| *running)
    }
}

/// The two live-stream servers' control slots and peer registries.
#[derive(Debug, Default)]
pub struct LiveStreams {
    pub logs: StreamControl,
    pub telemetry: StreamControl,
    pub log_peers: PeerRegistry,
    pub telemetry_peers: PeerRegistry,
}

/// The central struct holding all shared, agent-wide state. Wrapped in an
/// `Arc` and handed to every worker.
pub struct AgentState {
    pub config: ConfigStore,
    pub identity: NodeIdentity,
    pub sources: SourceRegistry,
    pub suppression: SuppressionChecker,
    pub queue: TelemetryQueue,
    pub publisher: EventPublisher,
    /// The compiled per-line matchers, rebuilt on keyword config changes.
    pub matchers: parking_lot::RwLock<LineMatchers>,
    pub http: reqwest::Client,
    pub processes: ProcessMonitor,
    /// The metric sampler; also used for out-of-band `get_metrics` requests.
    pub sampler: tokio::sync::Mutex<MetricSampler>,
    /// Every line of the primary log file, for the live log stream.
    pub log_tap: broadcast::Sender<LiveLogFrame>,
    /// Every snapshot, for the live telemetry stream.
    pub telemetry_tap: broadcast::Sender<Arc<MetricSnapshot>>,
    /// Sampler → alert engine.
    pub alert_tx: mpsc::Sender<Arc<MetricSnapshot>>,
    /// Signals interval-driven workers to restart their timers.
    pub interval_changed: broadcast::Sender<()>,
    /// The global shutdown signal observed by every worker loop.
    pub shutdown_tx: broadcast::Sender<()>,
    pub live: LiveStreams,
    pub health: ComponentHealth,
    /// Handle to the logging filter, for hot log-level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

impl std::fmt::Debug for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentState")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl AgentState {
    /// Initializes the entire agent state from the given configuration.
    /// The only fatal failures here are unopenable queue storage and an
    /// unusable HTTP client; everything else degrades.
    pub async fn initialize(
        config: ConfigStore,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<AgentInit, AgentError> {
        let identity = resolve_identity(&config);
        config.set_node_id(&identity.node_id);
        info!(
            "agent identity: node_id={} hostname={} machine_id={}",
            identity.node_id, identity.hostname, identity.machine_id
        );

        let http = reqwest::Client::builder()
            .user_agent(concat!("vigild/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build HTTP client: {e}")))?;

        // Layer in the remote snapshot (or its cache) before anything reads
        // the tree.
        config.sync_remote(&http).await;

        let queue_path = resolve_path(&config, &config.get_str("telemetry.queue_db_path"));
        let queue = TelemetryQueue::open(
            &queue_path,
            config.get_u64("telemetry.queue_max_size", 1000),
        )?;

        let rule_store_path = resolve_path(&config, &config.get_str("suppression.db_path"));
        let rule_store = match RuleStore::open(&rule_store_path) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("suppression rule store unavailable ({e}); running fail-open");
                None
            }
        };
        let suppression = SuppressionChecker::new(
            rule_store,
            Duration::from_secs(config.get_u64("suppression.cache_ttl", 60)),
        );

        let publisher = EventPublisher::new(BusConfig {
            url: config.get_str("messaging.bus.url"),
            subject: config.get_str("messaging.bus.subject"),
        });

        let matchers = matchers_from_config(&config)?;

        let sources = SourceRegistry::new();
        let agent_log_path = resolve_path(&config, &config.get_str("logging.path"));
        sources.seed_from_config(&config, &agent_log_path.to_string_lossy());

        let (log_tap, _) = broadcast::channel(LOG_TAP_CAPACITY);
        let (telemetry_tap, _) = broadcast::channel(TELEMETRY_TAP_CAPACITY);
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        let (interval_changed, _) = broadcast::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(AgentState {
            config,
            identity,
            sources,
            suppression,
            queue,
            publisher,
            matchers: parking_lot::RwLock::new(matchers),
            http,
            processes: ProcessMonitor::new(),
            sampler: tokio::sync::Mutex::new(MetricSampler::new()),
            log_tap,
            telemetry_tap,
            alert_tx,
            interval_changed,
            shutdown_tx,
            live: LiveStreams::default(),
            health: ComponentHealth::default(),
            log_reload_handle,
        });

        Ok(AgentInit { state, alert_rx })
    }

    /// Recompiles the line matchers from the current keyword configuration.
    pub fn rebuild_matchers(&self) {
        match matchers_from_config(&self.config) {
            Ok(matchers) => {
                *self.matchers.write() = matchers;
                info!("line matchers recompiled from configuration");
            }
            Err(e) => warn!("keeping previous line matchers: {e}"),
        }
    }

    /// Forwards a critical internal diagnostic through the bus fan-out path.
    pub fn report_internal_critical(self: &Arc<Self>, message: String) {
        let state = self.clone();
        tokio::spawn(async move {
            state
                .publisher
                .publish_internal(&state.identity.node_id, &state.identity.hostname, &message)
                .await;
        });
    }

    /// Static identity block for `/api/status`.
    pub fn system_info(&self) -> serde_json::Value {
        json!({
            "hostname": self.identity.hostname,
            "os": System::name(),
            "os_version": System::os_version(),
            "kernel": System::kernel_version(),
            "arch": System::cpu_arch(),
            "node_id": self.identity.node_id,
            "machine_id": self.identity.machine_id,
            "agent_version": self.identity.version,
        })
    }
}

/// Builds the per-line matchers from the monitoring keyword configuration,
/// falling back to the built-in keyword sets when the config is unusable.
pub fn matchers_from_config(config: &ConfigStore) -> Result<LineMatchers, AgentError> {
    let mut error_keywords = config.get_string_list("monitoring.error_keywords");
    if error_keywords.is_empty() {
        error_keywords = default_keywords("monitoring.error_keywords");
    }
    let mut critical = config.get_string_list("monitoring.priority_keywords.critical");
    if critical.is_empty() {
        critical = default_keywords("monitoring.priority_keywords.critical");
    }
    let mut high = config.get_string_list("monitoring.priority_keywords.high");
    if high.is_empty() {
        high = default_keywords("monitoring.priority_keywords.high");
    }
    LineMatchers::new(&error_keywords, &critical, &high)
}

fn default_keywords(path: &str) -> Vec<String> {
    let defaults = crate::config::default_config();
    let mut current = &defaults;
    for key in path.split('.') {
        match current.get(key) {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }
    current
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_identity(config: &ConfigStore) -> NodeIdentity {
    let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
    let node_id = config
        .get_opt_str("node.id")
        .or_else(detect_primary_ip)
        .unwrap_or_else(|| hostname.clone());
    let machine_id = Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("{hostname}-{node_id}").as_bytes(),
    )
    .to_string();
    NodeIdentity {
        node_id,
        machine_id,
        hostname,
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
    }
}

/// The primary non-loopback address, discovered without sending a packet.
fn detect_primary_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// Resolves a possibly-relative state file path against the config directory.
pub fn resolve_path(config: &ConfigStore, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        config.paths().dir.join(path)
    }
}
