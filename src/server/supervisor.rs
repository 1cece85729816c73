// src/server/supervisor.rs

//! The main supervision loop: waits for a shutdown signal, watches the
//! background workers for unexpected termination, and coordinates the
//! graceful shutdown sequence.

use super::context::AgentContext;
use crate::core::live::{log_stream, telemetry_stream};
use std::time::Duration;
use tracing::{error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long the supervisor waits for workers to drain after the signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Waits for a shutdown signal based on the operating system.
/// On Unix, it listens for SIGINT and SIGTERM. On Windows, Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// Supervises the running agent until shutdown.
pub async fn run(mut ctx: AgentContext) {
    loop {
        tokio::select! {
            biased; // Prioritize shutdown signals over other events.

            _ = await_shutdown_signal() => {
                break;
            },

            // Monitor background workers for unexpected termination.
            Some(result) = ctx.background_tasks.join_next() => {
                match result {
                    Ok(Ok(())) => info!("a background worker has completed"),
                    Ok(Err(e)) => { error!("CRITICAL: background worker failed: {e}. Shutting down."); break; }
                    Err(e) => { error!("CRITICAL: background worker panicked: {e:?}. Shutting down."); break; }
                }
            },
        }
    }

    // --- Graceful Shutdown Sequence ---
    info!("shutting down, signaling all workers");
    if ctx.state.shutdown_tx.send(()).is_err() {
        error!("failed to send shutdown signal; some workers may not terminate gracefully");
    }

    // Tailers have their own stop channels in addition to the global signal.
    ctx.state.sources.stop_all();

    if log_stream::stop(&ctx.state.live.logs).await {
        info!("live log stream stopped");
    }
    if telemetry_stream::stop(&ctx.state.live.telemetry).await {
        info!("telemetry stream stopped");
    }

    info!("waiting for workers to finish...");
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for workers to finish cleanly");
    }

    // Dropping the context releases the queue and rule-store connections.
    info!("agent shutdown complete");
}
