//! Shutdown trigger and serving phases.
//!
//! A single `watch` channel carries the trigger. The signal task in `main`
//! flips it on SIGINT/SIGTERM; tests flip it directly.

use std::sync::Arc;
use tokio::sync::watch;

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting and serving connections.
    Running,
    /// No longer accepting; waiting for in-flight requests.
    Draining,
    /// Listener closed and every connection finished or aborted.
    Stopped,
}

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All in-flight requests completed within the grace period.
    Graceful,
    /// The grace period expired and remaining connections were aborted.
    TimedOut,
}

/// Sending half of the shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Create a trigger and its first listener.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Request shutdown. Repeated calls are harmless.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolve once shutdown has been requested.
///
/// A dropped trigger counts as a request.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|requested| *requested).await;
}

/// Wait for SIGINT or SIGTERM, then fire `trigger`.
pub async fn signal_shutdown(trigger: ShutdownTrigger) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown...");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                if let Err(e) = ctrl_c.await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }

    trigger.fire();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_after_fire() {
        let (trigger, rx) = ShutdownTrigger::new();
        let waiter = tokio::spawn(wait_for_shutdown(rx));

        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_resolves_when_already_fired() {
        let (trigger, _rx) = ShutdownTrigger::new();
        trigger.fire();
        trigger.fire();

        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(trigger.subscribe()))
            .await
            .expect("already-fired trigger should resolve immediately");
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, rx) = ShutdownTrigger::new();
        drop(trigger);

        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .expect("dropped trigger should resolve");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_fired() {
        let (_trigger, rx) = ShutdownTrigger::new();
        let result = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(rx)).await;
        assert!(result.is_err());
    }
}
