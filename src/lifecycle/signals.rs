//! OS signal handling.
//!
//! SIGINT and SIGTERM trigger a graceful shutdown: the in-flight record
//! finishes, its result is recorded, and the run stops. A second signal
//! exits immediately.

use crate::lifecycle::shutdown::Shutdown;

/// Exit code used when a signal interrupted the process.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Spawn a task that triggers `shutdown` on the first signal.
pub fn spawn_signal_handler(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("Signal received, finishing the current record before stopping");
        shutdown.trigger();

        wait_for_signal().await;
        tracing::error!("Second signal received, exiting now");
        std::process::exit(i32::from(EXIT_INTERRUPTED));
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
