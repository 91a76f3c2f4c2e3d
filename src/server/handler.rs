//! Application callbacks
//!
//! The server decodes frames and hands complete messages to a
//! [`ConnectionHandler`]. Control frames (ping, pong, close) are answered by
//! the server itself and never reach the handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::broadcaster::Broadcaster;
use super::connection::Connection;
use crate::protocol::{CloseReason, Opcode};

/// A complete data message received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Text(_) => Opcode::Text,
            Self::Binary(_) => Opcode::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Callbacks for connection lifecycle events
///
/// Each connection's callbacks run on that connection's task, so a slow
/// `on_message` only delays reads from the same client.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once after the connection is open and registered
    async fn on_open(&self, _connection: &Arc<Connection>) {}

    /// Called for every text or binary message
    async fn on_message(&self, connection: &Arc<Connection>, message: Message);

    /// Called once after the connection has closed
    async fn on_close(&self, _connection: &Arc<Connection>, _reason: &CloseReason) {}
}

/// Sends every message back to its sender
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_message(&self, connection: &Arc<Connection>, message: Message) {
        match connection.send(message.opcode(), message.as_bytes()).await {
            Ok(true) => {}
            Ok(false) => warn!(conn_id = %connection.id(), "echo write failed"),
            Err(e) => debug!(conn_id = %connection.id(), error = %e, "echo dropped"),
        }
    }
}

/// Relays every message to the other clients of the same service
#[derive(Debug, Clone)]
pub struct RelayHandler {
    broadcaster: Broadcaster,
}

impl RelayHandler {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl ConnectionHandler for RelayHandler {
    async fn on_open(&self, connection: &Arc<Connection>) {
        debug!(conn_id = %connection.id(), service = connection.service(), "relay peer joined");
    }

    async fn on_message(&self, connection: &Arc<Connection>, message: Message) {
        let result = self
            .broadcaster
            .broadcast_filtered(message.opcode(), message.as_bytes(), |peer| {
                peer.id() != connection.id() && peer.service() == connection.service()
            })
            .await;

        match result {
            Ok(report) => debug!(
                conn_id = %connection.id(),
                delivered = report.delivered,
                failed = report.failed,
                "relayed message"
            ),
            Err(e) => warn!(conn_id = %connection.id(), error = %e, "relay failed"),
        }
    }

    async fn on_close(&self, connection: &Arc<Connection>, reason: &CloseReason) {
        debug!(conn_id = %connection.id(), %reason, "relay peer left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::tests::open_connection;
    use crate::server::registry::ConnectionRegistry;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_message_accessors() {
        let text = Message::Text("hey".to_string());
        assert_eq!(text.opcode(), Opcode::Text);
        assert_eq!(text.as_bytes(), b"hey");
        assert_eq!(text.len(), 3);

        let binary = Message::Binary(Vec::new());
        assert_eq!(binary.opcode(), Opcode::Binary);
        assert!(binary.is_empty());
    }

    #[tokio::test]
    async fn test_echo_handler() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut client) = open_connection(&registry, "/echo");

        EchoHandler
            .on_message(&connection, Message::Binary(vec![1, 2, 3]))
            .await;

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x82, 0x03, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_relay_skips_sender_and_other_services() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (sender, mut sender_client) = open_connection(&registry, "/chat");
        let (peer, mut peer_client) = open_connection(&registry, "/chat");
        let (other, mut other_client) = open_connection(&registry, "/news");
        for connection in [&sender, &peer, &other] {
            registry.add(connection).await;
        }

        let relay = RelayHandler::new(Broadcaster::new(Arc::clone(&registry)));
        relay
            .on_message(&sender, Message::Text("hello".to_string()))
            .await;

        let mut buf = [0u8; 7];
        peer_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x81\x05hello");

        // Nothing was written to the sender or the other service
        sender.disconnect(1000u16, "").await.unwrap();
        other.disconnect(1000u16, "").await.unwrap();
        let mut rest = Vec::new();
        sender_client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0x88, 0x02, 0x03, 0xE8]);
        rest.clear();
        other_client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0x88, 0x02, 0x03, 0xE8]);
    }
}
