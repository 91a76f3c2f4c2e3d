//! A single upgraded WebSocket connection
//!
//! Holds the write half of the transport behind an async mutex so frames
//! from concurrent senders go out whole and in call order. Lifecycle state
//! lives in a watch channel; the read loop subscribes to it so a
//! [`Connection::disconnect`] from any task cancels the pending read.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use crate::protocol::{encode, AcceptedHandshake, CloseCode, CloseReason, FrameError, Opcode};

/// Boxed write half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that can occur during connection operations
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Handshake accepted, upgrade response not yet written
    Connecting,
    Open,
    /// Close frame being exchanged
    Closing,
    /// Transport released; terminal
    Closed,
}

impl ConnectionState {
    pub fn is_terminating(self) -> bool {
        self >= Self::Closing
    }
}

/// An upgraded connection
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    handshake: AcceptedHandshake,
    state: watch::Sender<ConnectionState>,
    /// `None` once the transport has been released
    writer: Mutex<Option<BoxedWriter>>,
    close_reason: RwLock<Option<CloseReason>>,
    registry: Arc<ConnectionRegistry>,
    write_timeout: Option<Duration>,
}

impl Connection {
    /// Wrap the write half of an upgraded transport
    ///
    /// The connection starts in [`ConnectionState::Connecting`].
    pub fn new(
        handshake: AcceptedHandshake,
        peer_addr: Option<SocketAddr>,
        writer: BoxedWriter,
        registry: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        Self::with_write_timeout(handshake, peer_addr, writer, registry, None)
    }

    /// Like [`Connection::new`], bounding every frame write
    ///
    /// A write that does not finish in time releases the connection, since
    /// a partly written frame leaves the stream unusable.
    pub fn with_write_timeout(
        handshake: AcceptedHandshake,
        peer_addr: Option<SocketAddr>,
        writer: BoxedWriter,
        registry: Arc<ConnectionRegistry>,
        write_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            id: ConnectionId::generate(),
            peer_addr,
            handshake,
            state,
            writer: Mutex::new(Some(writer)),
            close_reason: RwLock::new(None),
            registry,
            write_timeout,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Service pattern the handshake matched
    pub fn service(&self) -> &str {
        &self.handshake.service
    }

    /// Request path without the query
    pub fn path(&self) -> &str {
        &self.handshake.path
    }

    /// Query parameter from the request target
    pub fn param(&self, name: &str) -> Option<&str> {
        self.handshake.param(name)
    }

    /// Path segment captured by a `{name}` in the service pattern
    pub fn capture(&self, name: &str) -> Option<&str> {
        self.handshake
            .captures
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn origin(&self) -> Option<&str> {
        self.handshake.origin.as_deref()
    }

    pub fn handshake(&self) -> &AcceptedHandshake {
        &self.handshake
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Close status recorded for this connection, once closing has begun
    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.read().await.clone()
    }

    /// Record the close status unless one is already set
    pub(crate) async fn record_close_reason(&self, reason: CloseReason) {
        let mut guard = self.close_reason.write().await;
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    /// Connecting -> Open
    pub(crate) fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Write bytes that are not a frame (the upgrade response)
    pub(crate) async fn write_raw(&self, bytes: &[u8]) -> ConnectionResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::ConnectionClosed)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encode and send one frame
    ///
    /// Returns `Ok(false)` if the transport write fails; cleanup is left to
    /// the caller. A write that exceeds the write timeout also returns
    /// `Ok(false)` and releases the connection.
    pub async fn send(&self, opcode: Opcode, payload: &[u8]) -> ConnectionResult<bool> {
        if !self.is_open() {
            return Err(ConnectionError::ConnectionClosed);
        }
        let frame = encode(opcode, payload)?;
        self.send_encoded(&frame).await
    }

    pub async fn send_text(&self, text: &str) -> ConnectionResult<bool> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> ConnectionResult<bool> {
        self.send(Opcode::Binary, data).await
    }

    pub async fn ping(&self, payload: &[u8]) -> ConnectionResult<bool> {
        self.send(Opcode::Ping, payload).await
    }

    /// Write an already encoded frame
    pub async fn send_encoded(&self, frame: &[u8]) -> ConnectionResult<bool> {
        let mut guard = self.writer.lock().await;
        // Re-check under the lock: a disconnect may have won the race
        if !self.is_open() {
            return Err(ConnectionError::ConnectionClosed);
        }
        let writer = guard.as_mut().ok_or(ConnectionError::ConnectionClosed)?;

        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        let result = match self.write_timeout {
            Some(limit) => timeout(limit, write).await,
            None => Ok(write.await),
        };

        match result {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                warn!(conn_id = %self.id, error = %e, "failed to write frame");
                Ok(false)
            }
            Err(_) => {
                warn!(conn_id = %self.id, "frame write timed out");
                guard.take();
                drop(guard);
                self.release(CloseCode::Other(1006), "write timed out").await;
                Ok(false)
            }
        }
    }

    /// Run the closing handshake and release the transport
    ///
    /// Sends a close frame carrying `code` and `reason`, shuts the transport
    /// down, cancels the pending read and drops the registry entry. Fails
    /// with [`ConnectionError::ConnectionClosed`] if closing already began.
    pub async fn disconnect(
        &self,
        code: impl Into<CloseCode>,
        reason: &str,
    ) -> ConnectionResult<()> {
        if !self.begin_closing() {
            return Err(ConnectionError::ConnectionClosed);
        }

        let close = CloseReason::new(code, reason);
        self.record_close_reason(close.clone()).await;

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // Close payloads are always within control frame limits
            let frame = encode(Opcode::Close, &close.encode())?;
            let sent = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            match sent {
                Ok(()) => debug!(conn_id = %self.id, code = %close.code, "sent close frame"),
                Err(e) => warn!(
                    conn_id = %self.id,
                    error = %e,
                    "transport failed before close frame was sent"
                ),
            }
            if let Err(e) = writer.shutdown().await {
                debug!(conn_id = %self.id, error = %e, "transport shutdown failed");
            }
        }

        self.finish().await;
        info!(conn_id = %self.id, code = %close.code, "connection closed");
        Ok(())
    }

    /// Release the transport without a close frame
    ///
    /// Used when the transport itself is unusable. Returns false if the
    /// connection was already closing.
    pub async fn release(&self, code: CloseCode, reason: &str) -> bool {
        if !self.begin_closing() {
            return false;
        }
        self.record_close_reason(CloseReason::new(code, reason)).await;

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        self.finish().await;
        warn!(conn_id = %self.id, reason, "connection released without closing handshake");
        true
    }

    /// Connecting/Open -> Closing; false if already closing or closed
    fn begin_closing(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminating() {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        })
    }

    async fn finish(&self) {
        self.state.send_replace(ConnectionState::Closed);
        self.registry.remove(self.id).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("service", &self.handshake.service)
            .field("path", &self.handshake.path)
            .field("state", &self.state())
            .finish()
    }
}
