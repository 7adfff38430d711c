//! Graceful shutdown coordination for streaming connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Tracks active streaming connections and broadcasts a shutdown signal.
///
/// Each connection calls [`register`](Self::register) and holds the returned
/// guard for its lifetime; the server flips the watch channel on shutdown and
/// then waits for the active count to drain to zero.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

/// RAII guard that decrements the active connection count on drop.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Register a connection. Returns a guard and a receiver that flips to
    /// `true` when shutdown begins.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ConnectionGuard {
            active: Arc::clone(&self.active),
            drained: Arc::clone(&self.drained),
        };
        (guard, self.tx.subscribe())
    }

    /// Signal all registered connections to close.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every registered connection has dropped its guard.
    pub async fn wait_for_all_closed(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn register_tracks_active_count() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.active_count(), 0);

        let (guard1, _rx1) = coordinator.register();
        let (guard2, _rx2) = coordinator.register();
        assert_eq!(coordinator.active_count(), 2);

        drop(guard1);
        assert_eq!(coordinator.active_count(), 1);
        drop(guard2);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_flips_receivers() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, mut rx) = coordinator.register();
        assert!(!*rx.borrow());

        coordinator.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_for_all_closed_returns_immediately_when_idle() {
        let coordinator = ShutdownCoordinator::new();
        tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_all_closed())
            .await
            .expect("should not block with no connections");
    }

    #[tokio::test]
    async fn wait_for_all_closed_blocks_until_guards_drop() {
        let coordinator = ShutdownCoordinator::new();
        let (guard, _rx) = coordinator.register();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_all_closed().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "waiter should still be blocked");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after guard drops")
            .unwrap();
    }
}
