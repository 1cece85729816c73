// src/core/live/log_stream.rs

//! The live log WebSocket server: pushes every line of the primary log file
//! to all connected peers. Push-only; inbound frames are ignored.

use super::{StreamHandle, StreamControl};
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
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Starts the log stream server on `ports.livelogs`. Returns the bound port;
/// a no-op (returning the current port) when already running.
pub async fn start(state: Arc<AgentState>) -> Result<u16, AgentError> {
    let control = &state.live.logs;
    if control.is_running().await {
        return Ok(control.port().await.unwrap_or_default());
    }

    let port = state.config.get_u64("ports.livelogs", 8755) as u16;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::Internal(format!("failed to bind log stream on port {port}: {e}")))?;
    info!("live log stream listening on ws://{addr}");

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let shutdown_rx = state.shutdown_tx.subscribe();
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        run_server(task_state, listener, stop_rx, shutdown_rx).await;
    });

    if !control
        .store(StreamHandle { port, stop_tx, task })
        .await
    {
        warn!("log stream was started concurrently, keeping the existing server");
    }
    Ok(port)
}

/// Stops the server via its control slot. Returns whether one was running.
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
        let mut tap = pump_state.log_tap.subscribe();
        loop {
            match tap.recv().await {
                Ok(frame) => match serde_json::to_string(&frame) {
                    Ok(message) => pump_state.live.log_peers.broadcast(&message),
                    Err(e) => error!("failed to serialize live log frame: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("log stream fell behind the tap, {missed} lines skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = stop_rx.recv() => info!("log stream server stopped"),
                _ = shutdown_rx.recv() => info!("log stream server shutting down"),
            }
        })
        .await;
    if let Err(e) = result {
        error!("log stream server error: {e}");
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
    let (id, mut rx) = state.live.log_peers.register();
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    };

    // Inbound frames are not interpreted; draining keeps the socket healthy.
    let reader = async {
        while let Some(frame) = stream.next().await {
            if frame.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    state.live.log_peers.deregister(id);
}
