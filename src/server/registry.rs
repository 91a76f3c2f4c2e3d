//! Registry of open connections
//!
//! Holds weak references only: the registry never keeps a connection alive
//! and never closes one. Entries are ordered by connection id, which follows
//! accept order.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::debug;

use super::connection::{Connection, ConnectionId, ConnectionState};

/// Registry of active connections (thread-safe via RwLock)
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Weak<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    ///
    /// Returns false if it is already registered or has been closed.
    pub async fn add(&self, connection: &Arc<Connection>) -> bool {
        if connection.state() == ConnectionState::Closed {
            return false;
        }
        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection.id()) {
            return false;
        }
        connections.insert(connection.id(), Arc::downgrade(connection));
        debug!(conn_id = %connection.id(), total = connections.len(), "registered connection");
        true
    }

    /// Drop a connection's entry; idempotent
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            debug!(conn_id = %id, "unregistered connection");
        }
        removed
    }

    /// Point-in-time copy of the live connections, in id order
    ///
    /// The lock is released before this returns, so callers may do I/O on
    /// the result without blocking registration.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .await
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).and_then(Weak::upgrade)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Number of registered entries
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop entries whose connection has been dropped without unregistering
    pub async fn prune(&self) -> usize {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|_, weak| weak.strong_count() > 0);
        before - connections.len()
    }
}
