use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{Registry, filter::EnvFilter, reload};
use vigild::config::ConfigStore;
use vigild::core::state::AgentState;
use vigild::core::tailer::TailerTask;

/// Builds a full agent state rooted in a temp directory, with unroutable
/// backend and bus endpoints so nothing leaves the host.
async fn test_state(dir: &tempfile::TempDir) -> Arc<AgentState> {
    std::fs::write(
        dir.path().join("config.json"),
        json!({
            "connectivity": { "telemetry_backend_url": "http://127.0.0.1:1" },
            "messaging": { "bus": { "url": "nats://127.0.0.1:1" } },
            "logging": { "path": "agent.log" },
        })
        .to_string(),
    )
    .unwrap();
    let config = ConfigStore::new(dir.path()).unwrap();
    let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
    let init = AgentState::initialize(config, Arc::new(handle)).await.unwrap();
    init.state
}

fn append(path: &std::path::Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{line}").unwrap();
    file.flush().unwrap();
}

async fn next_log(
    rx: &mut broadcast::Receiver<vigild::core::events::LiveLogFrame>,
    within: Duration,
) -> Option<String> {
    tokio::time::timeout(within, rx.recv())
        .await
        .ok()
        .and_then(|r| r.ok())
        .map(|frame| frame.log)
}

#[tokio::test]
async fn test_lines_emitted_in_order_from_eof() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("agent.log");
    append(&log_path, "line before start");

    let state = test_state(&dir).await;
    let auto = state
        .sources
        .list()
        .into_iter()
        .find(|s| s.auto_monitor)
        .unwrap();
    let mut tap = state.log_tap.subscribe();

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task = TailerTask::new(state.clone(), auto);
    let handle = tokio::spawn(async move { task.run(shutdown_rx, stop_rx).await });

    // Give the tailer time to open and seek to EOF.
    tokio::time::sleep(Duration::from_secs(1)).await;
    append(&log_path, "appended one");
    append(&log_path, "appended two");
    append(&log_path, "appended three");

    assert_eq!(
        next_log(&mut tap, Duration::from_secs(5)).await.as_deref(),
        Some("appended one")
    );
    assert_eq!(
        next_log(&mut tap, Duration::from_secs(5)).await.as_deref(),
        Some("appended two")
    );
    assert_eq!(
        next_log(&mut tap, Duration::from_secs(5)).await.as_deref(),
        Some("appended three")
    );

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("tailer should stop promptly")
        .unwrap();
}

#[tokio::test]
async fn test_waits_for_absent_file() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("agent.log");
    // Note: the log file does not exist yet.

    let state = test_state(&dir).await;
    let auto = state
        .sources
        .list()
        .into_iter()
        .find(|s| s.auto_monitor)
        .unwrap();
    let mut tap = state.log_tap.subscribe();

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task = TailerTask::new(state.clone(), auto);
    let handle = tokio::spawn(async move { task.run(shutdown_rx, stop_rx).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    // The file appears; the tailer opens it and seeks to EOF.
    std::fs::File::create(&log_path).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    append(&log_path, "born late");

    assert_eq!(
        next_log(&mut tap, Duration::from_secs(10)).await.as_deref(),
        Some("born late")
    );

    stop_tx.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn test_survives_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("agent.log");
    append(&log_path, "seed");

    let state = test_state(&dir).await;
    let auto = state
        .sources
        .list()
        .into_iter()
        .find(|s| s.auto_monitor)
        .unwrap();
    let mut tap = state.log_tap.subscribe();

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task = TailerTask::new(state.clone(), auto);
    let handle = tokio::spawn(async move { task.run(shutdown_rx, stop_rx).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    append(&log_path, "before rotation");
    assert_eq!(
        next_log(&mut tap, Duration::from_secs(5)).await.as_deref(),
        Some("before rotation")
    );

    // Rotate: replace the file wholesale. The tailer notices on its next
    // rotation check and re-reads the new file from the beginning.
    std::fs::remove_file(&log_path).unwrap();
    append(&log_path, "after rotation");

    assert_eq!(
        next_log(&mut tap, Duration::from_secs(20)).await.as_deref(),
        Some("after rotation")
    );

    stop_tx.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn test_disabled_source_idles_without_emitting() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("other.log");
    append(&log_path, "seed");

    let state = test_state(&dir).await;
    let source = state.sources.add(vigild::core::sources::LogSource::new(
        log_path.to_str().unwrap(),
        None,
        vigild::core::events::Priority::Medium,
    ));
    state
        .sources
        .update(&source.id, Some(false), None, None)
        .unwrap();

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task = TailerTask::new(state.clone(), source.clone());
    let handle = tokio::spawn(async move { task.run(shutdown_rx, stop_rx).await });

    tokio::time::sleep(Duration::from_secs(2)).await;
    // The worker is still alive while disabled.
    assert!(!handle.is_finished());

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("disabled tailer should still honor stop")
        .unwrap();
}
