//! WebSocket connection manager.
//!
//! Tracks active connections and their outbound channels, and reaps
//! connections that have gone quiet.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lattice_engine::ServerMessage;
use tokio::sync::mpsc;

/// Sender for a connection's outbound messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Client's node ID
    pub node_id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
    /// Unix seconds of the last inbound frame
    last_seen: AtomicI64,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, node_id: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let connection = Arc::new(Connection {
            id: conn_id.clone(),
            node_id: node_id.clone(),
            sender,
            last_seen: AtomicI64::new(chrono::Utc::now().timestamp()),
        });
        self.connections.insert(conn_id.clone(), connection);

        tracing::info!(conn_id = %conn_id, node_id = %node_id, "connection registered");
        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, connection)) = self.connections.remove(conn_id) {
            tracing::info!(
                conn_id = %conn_id,
                node_id = %connection.node_id,
                "connection unregistered"
            );
        }
    }

    /// Record inbound activity on a connection.
    pub fn touch(&self, conn_id: &str) {
        if let Some(connection) = self.connections.get(conn_id) {
            connection
                .last_seen
                .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        }
    }

    /// Send a message to one connection. A send to a gone connection is
    /// dropped silently: its socket task is already winding down.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(connection) => connection.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// The node id a connection announced at registration.
    pub fn node_id(&self, conn_id: &str) -> Option<String> {
        self.connections
            .get(conn_id)
            .map(|connection| connection.node_id.clone())
    }

    /// Connections idle longer than `timeout`. The caller disconnects them.
    pub fn idle_connections(&self, timeout: Duration) -> Vec<String> {
        let cutoff = chrono::Utc::now().timestamp() - timeout.as_secs() as i64;
        self.connections
            .iter()
            .filter(|entry| entry.value().last_seen.load(Ordering::Relaxed) < cutoff)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
