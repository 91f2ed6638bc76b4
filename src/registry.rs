//! Registry of live connections keyed by peer address.
//!
//! Closed connections are evicted by [`reap_task`], which the server runs
//! on a short interval. A single mutex guards every access, so a scan
//! never races an insert.

use crate::connection::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How often the reaper scans for closed connections.
pub const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Concurrency-safe map from key to connection.
#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a connection, replacing any previous entry for `key`.
    pub fn put(&self, key: impl Into<String>, conn: Arc<Connection>) {
        self.lock().insert(key.into(), conn);
    }

    /// Look up a connection.
    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.lock().get(key).cloned()
    }

    /// Snapshot of every tracked connection, in no particular order.
    pub fn get_all(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no tracked connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry whose connection is closed.
    ///
    /// Returns the number of entries removed.
    pub fn reap(&self) -> usize {
        let mut connections = self.lock();
        let before = connections.len();
        connections.retain(|_, conn| !conn.is_closed());
        before - connections.len()
    }
}

/// Periodically evict closed connections until `exit` fires.
pub(crate) async fn reap_task(registry: Arc<Registry>, exit: CancellationToken) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            _ = interval.tick() => {
                let count = registry.reap();
                if count > 0 {
                    debug!(count, "Removed closed connections");
                }
            }
        }
    }

    trace!("Reaper stopped");
}
