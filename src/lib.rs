//! wsgate
//!
//! RFC6455 WebSocket endpoint: opening handshake validation, frame codec,
//! connection registry and broadcast over tokio.

pub mod config;
pub mod protocol;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{
    Broadcaster, Connection, ConnectionHandler, ConnectionRegistry, Message, WebSocketServer,
};
