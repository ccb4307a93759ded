//! Shutdown coordination.
//!
//! # Responsibilities
//! - Broadcast the shutdown signal to async tasks (accept loop)
//! - Track live connections so they can be told to terminate
//! - Wait, up to a grace period, for connection threads to drain

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};

use crate::lifecycle::interrupts::{DeferredActions, RunMode};
use crate::net::ConnectionId;
use crate::observability::metrics;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

type TerminateFn = Arc<dyn Fn() + Send + Sync>;

struct Tracked {
    actions: DeferredActions,
    terminate: TerminateFn,
}

/// Registry of live connections and their interrupt queues.
#[derive(Default)]
pub struct ConnectionTracker {
    live: DashMap<ConnectionId, Tracked>,
    drained: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection until the returned guard is dropped.
    ///
    /// `terminate` runs on the connection's own thread, from a deferred
    /// action, when [`terminate_all`](Self::terminate_all) is called.
    pub fn register<F>(
        self: &Arc<Self>,
        id: ConnectionId,
        actions: DeferredActions,
        terminate: F,
    ) -> TrackedConnection
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.live.insert(
            id,
            Tracked {
                actions,
                terminate: Arc::new(terminate),
            },
        );
        metrics::connection_opened();
        TrackedConnection {
            id,
            tracker: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Ask every live connection to terminate at its next blocking point.
    ///
    /// Returns the number of connections notified.
    pub fn terminate_all(&self) -> usize {
        let mut notified = 0;
        for entry in self.live.iter() {
            let terminate = Arc::clone(&entry.value().terminate);
            entry
                .value()
                .actions
                .schedule("terminate", RunMode::MayBlock, move || terminate());
            notified += 1;
        }
        tracing::info!(connections = notified, "Asked connections to terminate");
        notified
    }

    /// Wait until no connection is tracked, or `grace` elapses.
    ///
    /// Returns whether every connection drained in time.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.drained.notified();
            if self.live.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.live.is_empty();
            }
        }
    }

    fn release(&self, id: ConnectionId) {
        if self.live.remove(&id).is_some() {
            metrics::connection_closed();
        }
        self.drained.notify_waiters();
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("live", &self.live.len())
            .finish()
    }
}

/// Keeps a connection registered while alive.
pub struct TrackedConnection {
    id: ConnectionId,
    tracker: Arc<ConnectionTracker>,
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}
