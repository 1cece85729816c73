// src/core/tailer.rs

//! Per-source log tailer: follows a growing file from EOF, survives the
//! file being absent or rotated, classifies each appended line, and feeds
//! accepted error lines through suppression into the bus publisher.

use crate::core::classify::{self, derive_severity};
use crate::core::events::{LiveLogFrame, LogEvent};
use crate::core::sources::LogSource;
use crate::core::state::AgentState;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Poll interval while the file has no new data or does not exist yet.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll interval while the source is administratively disabled.
const DISABLED_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive empty reads before the path is re-examined for rotation.
const ROTATION_CHECK_READS: u32 = 10;

/// One tailer worker. Spawned per enabled source; a disabled source keeps
/// its worker alive and idling so re-enabling needs no respawn.
pub struct TailerTask {
    state: Arc<AgentState>,
    source: LogSource,
}

impl TailerTask {
    pub fn new(state: Arc<AgentState>, source: LogSource) -> Self {
        Self { state, source }
    }

    pub async fn run(
        self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        info!(
            "tailer started for {} ({})",
            self.source.label, self.source.path
        );
        let mut seek_to_end = true;

        loop {
            // Waiting: the file may not exist yet, or the source is disabled.
            if !self.enabled() {
                if pause(&mut shutdown_rx, &mut stop_rx, DISABLED_INTERVAL).await {
                    break;
                }
                continue;
            }
            if !Path::new(&self.source.path).exists() {
                if pause(&mut shutdown_rx, &mut stop_rx, POLL_INTERVAL).await {
                    break;
                }
                continue;
            }

            match self.tail_once(seek_to_end, &mut shutdown_rx, &mut stop_rx).await {
                TailExit::Rotated => {
                    debug!("{}: rotation detected, reopening", self.source.path);
                    seek_to_end = false;
                }
                TailExit::Vanished => {
                    debug!("{}: file vanished, waiting for it to reappear", self.source.path);
                    seek_to_end = false;
                }
                TailExit::IoError => {
                    if pause(&mut shutdown_rx, &mut stop_rx, DISABLED_INTERVAL).await {
                        break;
                    }
                    seek_to_end = false;
                }
                TailExit::Stopped => break,
            }
        }
        info!("tailer stopped for {}", self.source.path);
    }

    /// Tails the currently open file until rotation, error, or stop.
    async fn tail_once(
        &self,
        seek_to_end: bool,
        shutdown_rx: &mut broadcast::Receiver<()>,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> TailExit {
        let file = match File::open(&self.source.path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("{}: open failed: {e}", self.source.path);
                return TailExit::IoError;
            }
        };
        let opened_ino = file_ino(&self.source.path).await;
        let mut reader = BufReader::new(file);
        let mut position = if seek_to_end {
            match reader.seek(SeekFrom::End(0)).await {
                Ok(pos) => pos,
                Err(e) => {
                    warn!("{}: seek failed: {e}", self.source.path);
                    return TailExit::IoError;
                }
            }
        } else {
            0
        };

        let mut empty_reads: u32 = 0;
        let mut line = String::new();

        loop {
            if !self.enabled() {
                if pause(shutdown_rx, stop_rx, DISABLED_INTERVAL).await {
                    return TailExit::Stopped;
                }
                continue;
            }

            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    empty_reads += 1;
                    if empty_reads >= ROTATION_CHECK_READS {
                        empty_reads = 0;
                        match self.check_rotation(opened_ino, position).await {
                            RotationState::Unchanged => {}
                            RotationState::Rotated => return TailExit::Rotated,
                            RotationState::Vanished => return TailExit::Vanished,
                        }
                    }
                    if pause(shutdown_rx, stop_rx, POLL_INTERVAL).await {
                        return TailExit::Stopped;
                    }
                }
                Ok(read) => {
                    position += read as u64;
                    empty_reads = 0;
                    self.process_line(line.trim_end_matches(['\n', '\r'])).await;
                }
                Err(e) => {
                    warn!("{}: read failed: {e}", self.source.path);
                    return TailExit::IoError;
                }
            }
        }
    }

    /// Classifies and forwards one appended line.
    async fn process_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }

        // The primary source feeds the live tap with every line, pre-gate.
        if self.source.auto_monitor {
            let _ = self
                .state
                .log_tap
                .send(LiveLogFrame::new(&self.state.identity.node_id, line));
        }

        if classify::is_internal_line(line) {
            return;
        }

        let classified = {
            let matchers = self.state.matchers.read();
            if matchers.is_error_line(line) {
                let severity = derive_severity(line);
                Some((severity, matchers.derive_priority(line, severity)))
            } else {
                None
            }
        };
        let Some((severity, priority)) = classified else {
            return;
        };

        // Fail-open: any suppression failure means the event flows through.
        let (suppressed, rule) = self
            .state
            .suppression
            .should_suppress(line, &self.state.identity.node_id);
        if suppressed {
            debug!(
                "suppressed line from {} (rule: {:?})",
                self.source.path,
                rule.map(|r| r.id)
            );
            return;
        }

        let event = LogEvent {
            timestamp: classify::extract_timestamp(line),
            node_id: self.state.identity.node_id.clone(),
            hostname: self.state.identity.hostname.clone(),
            source: self.source.path.clone(),
            log_label: self.source.label.clone(),
            log: line.to_string(),
            severity,
            priority,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        // Publish failure is already logged; the tailer never blocks on it.
        let _ = self.state.publisher.publish(&event).await;
    }

    async fn check_rotation(&self, opened_ino: Option<u64>, position: u64) -> RotationState {
        let metadata = match tokio::fs::metadata(&self.source.path).await {
            Ok(metadata) => metadata,
            Err(_) => return RotationState::Vanished,
        };
        if metadata.len() < position {
            return RotationState::Rotated;
        }
        match (opened_ino, metadata_ino(&metadata)) {
            (Some(old), Some(new)) if old != new => RotationState::Rotated,
            _ => RotationState::Unchanged,
        }
    }

    fn enabled(&self) -> bool {
        self.state.sources.is_enabled(&self.source.id)
    }
}

enum TailExit {
    Rotated,
    Vanished,
    IoError,
    Stopped,
}

enum RotationState {
    Unchanged,
    Rotated,
    Vanished,
}

/// Sleeps for `duration`, returning true when a stop or shutdown signal
/// arrives first.
async fn pause(
    shutdown_rx: &mut broadcast::Receiver<()>,
    stop_rx: &mut broadcast::Receiver<()>,
    duration: Duration,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown_rx.recv() => true,
        _ = stop_rx.recv() => true,
    }
}

async fn file_ino(path: &str) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| metadata_ino(&m))
}

#[cfg(unix)]
fn metadata_ino(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn metadata_ino(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}
