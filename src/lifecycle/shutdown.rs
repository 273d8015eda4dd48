//! Shutdown coordination.
//!
//! Two level-triggered signals: "stop requested" and "drained". Stopping is
//! one-way; once drained is set it stays observable to any number of late
//! waiters.

use tokio::sync::watch;

/// Coordinator for graceful shutdown.
#[derive(Debug)]
pub struct Shutdown {
    stop_tx: watch::Sender<bool>,
    drained_tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (drained_tx, _) = watch::channel(false);
        Self { stop_tx, drained_tx }
    }

    /// Request the server to stop. Idempotent; returns `true` only for the
    /// call that initiated the stop.
    pub fn request_stop(&self) -> bool {
        let first = !self.stop_tx.send_replace(true);
        if first {
            tracing::info!("stop requested");
        }
        first
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Subscribe to the stop signal.
    pub fn stop_requested(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Record that every connection has finished. Called exactly once by the
    /// admission controller at the end of its drain.
    pub(crate) fn mark_drained(&self) {
        self.drained_tx.send_replace(true);
    }

    pub fn is_drained(&self) -> bool {
        *self.drained_tx.borrow()
    }

    /// Wait until all connections have drained. Returns immediately once the
    /// drain is final; any number of tasks may wait concurrently or after
    /// the fact.
    pub async fn wait_drained(&self) {
        let mut rx = self.drained_tx.subscribe();
        // The sender lives in self, so this cannot fail while we're here.
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
