// src/core/live/mod.rs

//! Push-only live-stream endpoints and their shared peer machinery.

pub mod log_stream;
pub mod telemetry_stream;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Per-peer outbound buffer. A peer that cannot drain this many frames
/// starts losing frames rather than blocking the broadcaster.
const PEER_BUFFER: usize = 64;

/// Connected peers of one stream server. Broadcasting copies the sender set
/// under the lock, releases it, then sends, so a slow socket never holds
/// the registry.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(PEER_BUFFER);
        self.peers.lock().insert(id, tx);
        info!("live peer {id} connected (total: {})", self.count());
        (id, rx)
    }

    pub fn deregister(&self, id: u64) {
        if self.peers.lock().remove(&id).is_some() {
            info!("live peer {id} disconnected (total: {})", self.count());
        }
    }

    /// Sends a frame to every registered peer, pruning closed ones.
    pub fn broadcast(&self, message: &str) {
        let senders: Vec<(u64, mpsc::Sender<String>)> = self
            .peers
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        for (id, tx) in senders {
            match tx.try_send(message.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("live peer {id} is lagging, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.deregister(id);
                }
            }
        }
    }

    /// Sends a frame to a single peer, if still registered.
    pub fn send_to(&self, id: u64, message: &str) {
        let sender = self.peers.lock().get(&id).cloned();
        if let Some(tx) = sender
            && tx.try_send(message.to_string()).is_err()
        {
            self.deregister(id);
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }
}

/// Handle to a running stream server.
#[derive(Debug)]
pub struct StreamHandle {
    pub port: u16,
    pub stop_tx: broadcast::Sender<()>,
    pub task: JoinHandle<()>,
}

/// Start/stop slot for one stream server, driven by `/api/control`.
#[derive(Debug, Default)]
pub struct StreamControl {
    handle: tokio::sync::Mutex<Option<StreamHandle>>,
}

impl StreamControl {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn port(&self) -> Option<u16> {
        self.handle.lock().await.as_ref().map(|h| h.port)
    }

    /// Stores the handle of a freshly started server. When a server is
    /// already running the new task is aborted and false is returned.
    pub async fn store(&self, handle: StreamHandle) -> bool {
        let mut slot = self.handle.lock().await;
        if slot.as_ref().map(|h| !h.task.is_finished()).unwrap_or(false) {
            handle.task.abort();
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Signals the server to stop. Returns whether a server was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.handle.lock().await;
        match slot.take() {
            Some(handle) => {
                let _ = handle.stop_tx.send(());
                true
            }
            None => false,
        }
    }
}
