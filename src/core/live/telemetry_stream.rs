// src/core/live/telemetry_stream.rs

//! The telemetry WebSocket server: greets each peer, pushes every snapshot,
//! and answers two peer commands (`get_metrics`, `ping`).

use super::{StreamControl, StreamHandle};
use crate::core::errors::AgentError;
use crate::core::state::AgentState;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Starts the telemetry stream server on `ports.telemetry_ws`. Returns the
/// bound port and broadcast interval.
pub async fn start(state: Arc<AgentState>) -> Result<(u16, u64), AgentError> {
    let interval = state.config.get_u64("intervals.telemetry", 3).max(1);
    let control = &state.live.telemetry;
    if control.is_running().await {
        return Ok((control.port().await.unwrap_or_default(), interval));
    }

    let port = state.config.get_u64("ports.telemetry_ws", 8756) as u16;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        AgentError::Internal(format!(
            "failed to bind telemetry stream on port {port}: {e}"
        ))
    })?;
    info!("telemetry stream listening on ws://{addr} (interval: {interval}s)");

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        run_server(task_state, listener, stop_rx, shutdown_rx).await;
    });

    if !control.store(StreamHandle { port, stop_tx, task }).await {
        warn!("telemetry stream was started concurrently, keeping the existing server");
    }
    Ok((port, interval))
}

pub async fn stop(control: &StreamControl) -> bool {
    control.stop().await
}

async fn run_server(
    state: Arc<AgentState>,
    listener: tokio::net::TcpListener,
    mut stop_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = Router::new()
        .route("/", get(ws_handler))
        .with_state(state.clone());

    let pump_state = state.clone();
    let pump = tokio::spawn(async move {
        let mut tap = pump_state.telemetry_tap.subscribe();
        loop {
            match tap.recv().await {
                Ok(snapshot) => match serde_json::to_string(snapshot.as_ref()) {
                    Ok(message) => pump_state.live.telemetry_peers.broadcast(&message),
                    Err(e) => error!("failed to serialize snapshot: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("telemetry stream fell behind the tap, {missed} snapshots skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = stop_rx.recv() => info!("telemetry stream server stopped"),
                _ = shutdown_rx.recv() => info!("telemetry stream server shutting down"),
            }
        })
        .await;
    if let Err(e) = result {
        error!("telemetry stream server error: {e}");
    }
    pump.abort();
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AgentState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AgentState>) {
    let (id, mut rx) = state.live.telemetry_peers.register();
    let (mut sink, mut stream) = socket.split();

    let welcome = json!({
        "type": "connection",
        "status": "connected",
        "node_id": state.identity.node_id,
        "interval": state.config.get_u64("intervals.telemetry", 3).max(1),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if sink
        .send(Message::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        state.live.telemetry_peers.deregister(id);
        return;
    }

    let writer = async {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    };

    let reader_state = state.clone();
    let reader = async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    handle_command(&reader_state, id, text.as_str()).await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    state.live.telemetry_peers.deregister(id);
}

/// Interprets one inbound peer command; malformed JSON is ignored.
async fn handle_command(state: &Arc<AgentState>, peer_id: u64, text: &str) {
    let Ok(request) = serde_json::from_str::<Value>(text) else {
        return;
    };
    match request.get("command").and_then(Value::as_str) {
        Some("get_metrics") => {
            let snapshot = {
                let mut sampler = state.sampler.lock().await;
                sampler
                    .sample(&state.identity.node_id, &state.identity.machine_id)
                    .await
            };
            match serde_json::to_string(&snapshot) {
                Ok(message) => state.live.telemetry_peers.send_to(peer_id, &message),
                Err(e) => error!("failed to serialize out-of-band snapshot: {e}"),
            }
        }
        Some("ping") => {
            let pong = json!({
                "type": "pong",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            state
                .live
                .telemetry_peers
                .send_to(peer_id, &pong.to_string());
        }
        _ => {}
    }
}
