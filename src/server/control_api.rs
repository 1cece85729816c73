// src/server/control_api.rs

//! The local control HTTP surface: health, runtime status, live-stream
//! control, configuration management, monitored-file management, and the
//! process inspection endpoints.

use crate::config::{ChangeSet, ConfigStore};
use crate::core::errors::AgentError;
use crate::core::events::Priority;
use crate::core::live::{log_stream, telemetry_stream};
use crate::core::metrics::processes::ProcessSort;
use crate::core::sources::LogSource;
use crate::core::state::AgentState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

/// Runs the control API server until shutdown.
pub async fn run_control_server(state: Arc<AgentState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = state.config.get_u64("ports.control", 8754) as u16;
    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind control API on port {port}: {e}");
            return;
        }
    };
    info!("control API listening on http://{addr}");
    state.health.control_api.store(true, Ordering::Relaxed);

    let serve_state = state.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            serve_state.health.control_api.store(false, Ordering::Relaxed);
            info!("control API shutting down");
        })
        .await
    {
        error!("control API server error: {e}");
    }
}

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/control", post(control))
        .route("/api/config", get(config_get).post(config_set))
        .route("/api/config/reload", post(config_reload))
        .route("/api/config/schema", get(config_schema))
        .route("/api/monitored-files", get(sources_list).post(sources_add))
        .route("/api/monitored-files/reload", post(sources_reload))
        .route(
            "/api/monitored-files/{id}",
            put(sources_update).delete(sources_delete),
        )
        .route("/api/processes", get(processes_list))
        .route("/api/processes/{pid}", get(process_details))
        .route("/api/processes/{pid}/kill", post(process_kill))
        .route("/api/processes/{pid}/history", get(process_history))
        .route("/api/processes/{pid}/tree", get(process_tree))
        .with_state(state)
}

/// Structured error body with the matching HTTP status.
struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "success": false, "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

// --- Health & status ---

async fn health(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    let components = state.health.snapshot();
    let healthy = state.health.all_running();
    let status = if healthy { "ok" } else { "degraded" };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let sources = state.sources.list();
    let body = json!({
        "status": status,
        "service": "vigild",
        "version": state.identity.version,
        "uptime_seconds": state.identity.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "node_id": state.identity.node_id,
        "ports": {
            "control": state.config.get_u64("ports.control", 8754),
            "livelogs": state.config.get_u64("ports.livelogs", 8755),
            "telemetry_ws": state.config.get_u64("ports.telemetry_ws", 8756),
        },
        "components": components,
        "monitoring": {
            "sources": sources.len(),
            "enabled_sources": sources.iter().filter(|s| s.enabled).count(),
            "queue_size": state.queue.len(),
            "livelogs_running": state.live.logs.is_running().await,
            "telemetry_stream_running": state.live.telemetry.is_running().await,
        },
    });
    (code, Json(body))
}

async fn status(State(state): State<Arc<AgentState>>) -> Json<Value> {
    Json(json!({
        "system": state.system_info(),
        "uptime_seconds": state.identity.started_at.elapsed().as_secs(),
        "components": state.health.snapshot(),
        "sources": state.sources.list(),
        "suppression": state.suppression.stats_json(),
        "queue": state.queue.stats(),
        "live": {
            "log_peers": state.live.log_peers.count(),
            "telemetry_peers": state.live.telemetry_peers.count(),
            "livelogs_running": state.live.logs.is_running().await,
            "telemetry_stream_running": state.live.telemetry.is_running().await,
        },
    }))
}

// --- Live-stream control ---

#[derive(Deserialize)]
struct ControlRequest {
    command: String,
}

async fn control(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<Value>, ApiError> {
    let pid = std::process::id();
    match request.command.as_str() {
        "start_livelogs" => {
            let port = log_stream::start(state.clone()).await?;
            Ok(Json(json!({ "status": "started", "pid": pid, "ws_port": port })))
        }
        "stop_livelogs" => {
            let stopped = log_stream::stop(&state.live.logs).await;
            Ok(Json(json!({
                "status": if stopped { "stopped" } else { "not_running" },
                "pid": pid,
            })))
        }
        "start_telemetry" => {
            let (port, interval) = telemetry_stream::start(state.clone()).await?;
            Ok(Json(json!({
                "status": "started",
                "pid": pid,
                "ws_port": port,
                "interval": interval,
            })))
        }
        "stop_telemetry" => {
            let stopped = telemetry_stream::stop(&state.live.telemetry).await;
            Ok(Json(json!({
                "status": if stopped { "stopped" } else { "not_running" },
                "pid": pid,
            })))
        }
        other => Err(AgentError::InvalidRequest(format!("unknown command '{other}'")).into()),
    }
}

// --- Configuration ---

async fn config_get(State(state): State<Arc<AgentState>>) -> Json<Value> {
    Json(state.config.get_all())
}

#[derive(Deserialize)]
struct ConfigSetRequest {
    path: String,
    value: Value,
}

async fn config_set(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<ConfigSetRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.path.trim().is_empty() {
        return Err(AgentError::InvalidRequest("path cannot be empty".to_string()).into());
    }
    let old = state.config.get(&request.path).unwrap_or(Value::Null);
    state.config.set(&request.path, request.value.clone());
    state.config.save()?;

    let mut changes = ChangeSet::new();
    changes.insert(request.path.clone(), (old, request.value));
    apply_config_changes(&state, &changes);
    Ok(Json(json!({ "success": true, "path": request.path })))
}

async fn config_reload(State(state): State<Arc<AgentState>>) -> Json<Value> {
    let changes = state.config.reload(&state.http).await;
    apply_config_changes(&state, &changes);
    let rendered: serde_json::Map<String, Value> = changes
        .iter()
        .map(|(path, (old, new))| (path.clone(), json!([old, new])))
        .collect();
    Json(json!({ "success": true, "changes": rendered }))
}

async fn config_schema() -> Json<Value> {
    Json(ConfigStore::schema())
}

/// Applies runtime-applicable configuration changes: the logging level and
/// keyword sets take effect immediately; interval changes restart the
/// affected workers' timers. Everything else waits for a worker restart.
pub fn apply_config_changes(state: &Arc<AgentState>, changes: &ChangeSet) {
    let mut rebuild_matchers = false;
    let mut signal_intervals = false;

    for (path, (_, new)) in changes {
        match path.as_str() {
            "logging.level" => {
                let level = new.as_str().unwrap_or("info");
                match EnvFilter::try_new(level) {
                    Ok(filter) => {
                        if state.log_reload_handle.reload(filter).is_ok() {
                            info!("log level changed to '{level}'");
                        }
                    }
                    Err(e) => warn!("invalid log level '{level}': {e}"),
                }
            }
            p if p.starts_with("monitoring.error_keywords")
                || p.starts_with("monitoring.priority_keywords") =>
            {
                rebuild_matchers = true;
            }
            p if p.starts_with("intervals.") => {
                signal_intervals = true;
            }
            _ => {}
        }
    }

    if rebuild_matchers {
        state.rebuild_matchers();
    }
    if signal_intervals && state.interval_changed.send(()).is_err() {
        warn!("no interval-driven workers to notify");
    }
}

// --- Monitored files ---

async fn sources_list(State(state): State<Arc<AgentState>>) -> Json<Value> {
    Json(json!({ "files": state.sources.list() }))
}

#[derive(Deserialize)]
struct AddSourceRequest {
    path: String,
    label: Option<String>,
    priority: Option<String>,
}

async fn sources_add(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<AddSourceRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.path.trim().is_empty() {
        return Err(AgentError::InvalidRequest("path cannot be empty".to_string()).into());
    }
    let priority = match request.priority {
        Some(raw) => Priority::from_str(&raw)
            .map_err(|_| AgentError::InvalidRequest(format!("invalid priority '{raw}'")))?,
        None => Priority::Medium,
    };
    let source = state
        .sources
        .add(LogSource::new(&request.path, request.label, priority));
    state.sources.persist_to_config(&state.config)?;
    super::spawner::spawn_tailer(&state, source.clone());
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "file": source }))))
}

#[derive(Deserialize)]
struct UpdateSourceRequest {
    enabled: Option<bool>,
    label: Option<String>,
    priority: Option<String>,
}

async fn sources_update(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateSourceRequest>,
) -> Result<Json<Value>, ApiError> {
    let priority = match request.priority {
        Some(raw) => Some(
            Priority::from_str(&raw)
                .map_err(|_| AgentError::InvalidRequest(format!("invalid priority '{raw}'")))?,
        ),
        None => None,
    };
    let source = state
        .sources
        .update(&id, request.enabled, request.label, priority)?;
    state.sources.persist_to_config(&state.config)?;
    Ok(Json(json!({ "success": true, "file": source })))
}

async fn sources_delete(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let source = state.sources.remove(&id)?;
    state.sources.persist_to_config(&state.config)?;
    Ok(Json(json!({ "success": true, "removed": source })))
}

async fn sources_reload(State(state): State<Arc<AgentState>>) -> Json<Value> {
    state.sources.stop_all();
    let agent_log =
        crate::core::state::resolve_path(&state.config, &state.config.get_str("logging.path"));
    state
        .sources
        .seed_from_config(&state.config, &agent_log.to_string_lossy());
    for source in state.sources.list() {
        super::spawner::spawn_tailer(&state, source);
    }
    Json(json!({ "success": true, "files": state.sources.list() }))
}

// --- Processes ---

#[derive(Deserialize)]
struct ProcessListQuery {
    limit: Option<usize>,
    #[serde(rename = "sortBy")]
    sort_by: Option<String>,
}

async fn processes_list(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<ProcessListQuery>,
) -> Result<Json<Value>, ApiError> {
    let sort = match query.sort_by.as_deref() {
        None | Some("cpu") => ProcessSort::Cpu,
        Some("memory") => ProcessSort::Memory,
        Some(other) => {
            return Err(
                AgentError::InvalidRequest(format!("invalid sortBy '{other}'")).into(),
            );
        }
    };
    let limit = query.limit.unwrap_or(10).clamp(1, 500);
    let processes = state.processes.list(limit, sort).await;
    Ok(Json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": processes.len(),
        "processes": processes,
    })))
}

async fn process_details(
    State(state): State<Arc<AgentState>>,
    Path(pid): Path<u32>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.processes.details(pid).await?))
}

#[derive(Deserialize, Default)]
struct KillRequest {
    #[serde(default)]
    force: bool,
}

async fn process_kill(
    State(state): State<Arc<AgentState>>,
    Path(pid): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    // The body is optional; an absent or malformed one means no force.
    let force = serde_json::from_str::<KillRequest>(&body)
        .map(|request| request.force)
        .unwrap_or(false);
    Ok(Json(state.processes.kill(pid, force).await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    hours: Option<i64>,
}

async fn process_history(
    State(state): State<Arc<AgentState>>,
    Path(pid): Path<u32>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 7);
    Json(state.processes.history(pid, hours))
}

async fn process_tree(
    State(state): State<Arc<AgentState>>,
    Path(pid): Path<u32>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.processes.tree(pid).await?))
}
