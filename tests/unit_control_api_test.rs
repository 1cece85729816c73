use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{Registry, filter::EnvFilter, reload};
use vigild::config::ConfigStore;
use vigild::core::state::AgentState;
use vigild::server::control_api;

/// Builds a full agent state in a temp dir and serves the control router on
/// an ephemeral port. Live-stream ports are zeroed so tests never collide.
async fn serve_api(dir: &tempfile::TempDir) -> (Arc<AgentState>, String) {
    std::fs::write(
        dir.path().join("config.json"),
        json!({
            "connectivity": { "telemetry_backend_url": "http://127.0.0.1:1" },
            "messaging": { "bus": { "url": "nats://127.0.0.1:1" } },
            "ports": { "livelogs": 0, "telemetry_ws": 0 },
        })
        .to_string(),
    )
    .unwrap();
    let config = ConfigStore::new(dir.path()).unwrap();
    let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
    let init = AgentState::initialize(config, Arc::new(handle)).await.unwrap();
    let state = init.state;

    let app = control_api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("http://{addr}"))
}

#[tokio::test]
async fn test_health_degraded_when_workers_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, base) = serve_api(&dir).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status().as_u16(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["service"], "vigild");
    assert!(body["components"].is_object());
    assert!(body["ports"]["control"].is_u64());
}

#[tokio::test]
async fn test_health_ok_when_components_running() {
    let dir = tempfile::tempdir().unwrap();
    let (state, base) = serve_api(&dir).await;

    use std::sync::atomic::Ordering;
    state.health.tailers.store(true, Ordering::Relaxed);
    state.health.sampler.store(true, Ordering::Relaxed);
    state.health.alert_engine.store(true, Ordering::Relaxed);
    state.health.poster.store(true, Ordering::Relaxed);
    state.health.heartbeat.store(true, Ordering::Relaxed);
    state.health.control_api.store(true, Ordering::Relaxed);

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_config_get_set() {
    let dir = tempfile::tempdir().unwrap();
    let (state, base) = serve_api(&dir).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ports"]["control"], json!(8754));

    let response = client
        .post(format!("{base}/api/config"))
        .json(&json!({ "path": "intervals.telemetry", "value": 7 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(state.config.get_u64("intervals.telemetry", 0), 7);

    // Empty path is a structured 400.
    let response = client
        .post(format!("{base}/api/config"))
        .json(&json!({ "path": "", "value": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_config_schema() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, base) = serve_api(&dir).await;
    let body: Value = reqwest::get(format!("{base}/api/config/schema"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["alerts"].is_object());
}

#[tokio::test]
async fn test_monitored_files_crud() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, base) = serve_api(&dir).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/monitored-files"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    let auto_id = files[0]["id"].as_str().unwrap().to_string();
    assert_eq!(files[0]["auto_monitor"], json!(true));

    // Add a source.
    let log_path = dir.path().join("app.log");
    let response = client
        .post(format!("{base}/api/monitored-files"))
        .json(&json!({ "path": log_path, "priority": "high" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    let new_id = body["file"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["file"]["label"], json!("app"));

    // Disable it, then remove it.
    let response = client
        .put(format!("{base}/api/monitored-files/{new_id}"))
        .json(&json!({ "enabled": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = client
        .delete(format!("{base}/api/monitored-files/{new_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The auto-monitor source rejects both disable and delete.
    let response = client
        .put(format!("{base}/api/monitored-files/{auto_id}"))
        .json(&json!({ "enabled": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let response = client
        .delete(format!("{base}/api/monitored-files/{auto_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_control_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, base) = serve_api(&dir).await;
    let client = reqwest::Client::new();

    // Stopping a stream that never started reports not_running.
    let body: Value = client
        .post(format!("{base}/api/control"))
        .json(&json!({ "command": "stop_livelogs" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("not_running"));

    // Start and stop the telemetry stream on an ephemeral port.
    let response = client
        .post(format!("{base}/api/control"))
        .json(&json!({ "command": "start_telemetry" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("started"));
    assert!(body["interval"].is_u64());

    let body: Value = client
        .post(format!("{base}/api/control"))
        .json(&json!({ "command": "stop_telemetry" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("stopped"));

    // Unknown commands are a structured 400.
    let response = client
        .post(format!("{base}/api/control"))
        .json(&json!({ "command": "reboot" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_status_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, base) = serve_api(&dir).await;

    let body: Value = reqwest::get(format!("{base}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["system"]["hostname"].is_string());
    assert!(body["suppression"]["total_checks"].is_u64());
    assert_eq!(body["queue"]["total"], json!(0));
    assert!(body["sources"].as_array().unwrap().len() >= 1);
}

#[tokio::test]
async fn test_process_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, base) = serve_api(&dir).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/processes?limit=5&sortBy=memory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let processes = body["processes"].as_array().unwrap();
    assert!(!processes.is_empty());
    assert!(processes.len() <= 5);

    // Our own pid exists and has details and a tree.
    let pid = std::process::id();
    let body: Value = client
        .get(format!("{base}/api/processes/{pid}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["pid"], json!(pid));
    assert_eq!(body["success"], json!(true));

    let response = client
        .get(format!("{base}/api/processes/{pid}/tree"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = client
        .get(format!("{base}/api/processes/{pid}/history?hours=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["pid"], json!(pid));

    // An invalid sort key is rejected.
    let response = client
        .get(format!("{base}/api/processes?sortBy=bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // A pid that cannot exist yields a structured 404.
    let response = client
        .get(format!("{base}/api/processes/4294967294"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}
