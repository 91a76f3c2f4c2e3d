//! WebSocket server module
//!
//! Accepts connections, tracks the open ones and delivers messages to the
//! application handler and back out to clients.

mod broadcaster;
mod connection;
mod handler;
mod registry;
mod websocket;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use connection::{
    Connection, ConnectionError, ConnectionId, ConnectionResult, ConnectionState,
};
pub use handler::{ConnectionHandler, EchoHandler, Message, RelayHandler};
pub use registry::ConnectionRegistry;
pub use websocket::{ConnectOutcome, Transport, Upgraded, WebSocketServer, MAX_HANDSHAKE_LEN};
