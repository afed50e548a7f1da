//! Signal handling for graceful shutdown.
//!
//! `blockctl run` stops reading directives on SIGINT or SIGTERM and
//! commits whatever is still queued before exiting.

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Resolves once SIGINT or SIGTERM is received.
///
/// If no handler can be registered (restricted environments) the future
/// never resolves and the daemon only stops at end of input.
pub async fn shutdown_signal() {
    let sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGINT handler: {}", e);
            None
        }
    };

    let sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            None
        }
    };

    match (sigint, sigterm) {
        (Some(mut int), Some(mut term)) => {
            tokio::select! {
                _ = int.recv() => info!("Received SIGINT, shutting down"),
                _ = term.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        (Some(mut int), None) => {
            int.recv().await;
            info!("Received SIGINT, shutting down");
        }
        (None, Some(mut term)) => {
            term.recv().await;
            info!("Received SIGTERM, shutting down");
        }
        (None, None) => {
            warn!("No signal handlers registered - graceful shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal_waits_for_signal() {
        let result = tokio::time::timeout(Duration::from_millis(50), shutdown_signal()).await;
        assert!(result.is_err());
    }
}
