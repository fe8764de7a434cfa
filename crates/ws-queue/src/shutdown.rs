//! Cooperative shutdown coordination.
//!
//! Components subscribe and `select!` on the returned receiver alongside
//! their main loop; the daemon triggers shutdown once, and the flag makes
//! repeat triggers harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Check whether shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_the_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        assert!(!signal.is_shutting_down());

        signal.trigger();
        signal.trigger(); // second trigger is a no-op

        assert!(signal.is_shutting_down());
        rx.recv().await.unwrap();
    }
}
