//! Program-wide shutdown signaling and deadlines (spec.md §9: "a single
//! program-wide `Context` carries shutdown signaling and deadlines").
//!
//! Replaces the source's global mutable "session"/"agent manager"
//! singletons with explicit dependency injection: collaborators are
//! constructed in `main.rs` and passed by value, never reached through a
//! global.

use std::time::Duration;

use tokio::sync::broadcast;

/// Shutdown order (spec.md §5): ingestor closes first, router drains
/// (bounded 10s), reconciler aborts, HTTP server drains, stores close.
#[derive(Clone)]
pub struct Context {
    shutdown_tx: broadcast::Sender<()>,
    pub router_drain_timeout: Duration,
}

impl Context {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            router_drain_timeout: Duration::from_secs(10),
        }
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_is_broadcast_to_all_subscribers() {
        let ctx = Context::new();
        let mut a = ctx.shutdown_signal();
        let mut b = ctx.shutdown_signal();
        ctx.trigger_shutdown();
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
