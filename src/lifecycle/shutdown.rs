//! Shutdown coordination.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Hands out child tokens to every long-running task: the sync run, the
/// health loop and the health server.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled when shutdown is triggered.
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_subscribers() {
        let shutdown = Shutdown::new();
        let a = shutdown.subscribe();
        let b = shutdown.subscribe();
        assert!(!a.is_cancelled());

        shutdown.trigger();
        shutdown.trigger();
        a.cancelled().await;
        assert!(b.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_propagate_up() {
        let shutdown = Shutdown::new();
        shutdown.subscribe().cancel();
        assert!(!shutdown.is_triggered());
    }
}
