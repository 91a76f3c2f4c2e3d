//! WebSocket server implementation
//!
//! Listens on the configured address, runs the opening handshake on each
//! accepted stream and drives one read loop per upgraded connection. Every
//! connection gets its own task; the accept loop never waits on
//! per-connection I/O.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::broadcaster::Broadcaster;
use super::connection::{Connection, ConnectionError, ConnectionResult, ConnectionState};
use super::handler::{ConnectionHandler, Message};
use super::registry::ConnectionRegistry;
use crate::config::{ConfigError, ServerConfig};
use crate::protocol::{
    decode_with_limit, frame_len, CloseCode, CloseReason, Frame, FrameError, HandshakeRejection,
    HandshakeValidator, Opcode,
};

/// Largest opening handshake accepted, header block included
pub const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

const READ_CHUNK: usize = 8 * 1024;

const SHUTDOWN_REASON: &str = "server shutting down";

/// How long `run_on` waits for connection tasks after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Byte stream a connection can be upgraded over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An open connection plus the read half its read loop consumes
pub struct Upgraded<T> {
    pub connection: Arc<Connection>,
    reader: ReadHalf<T>,
    /// Bytes received after the handshake, not yet decoded
    buffer: Vec<u8>,
    /// Keeps the latest value, so a shutdown before `serve` is still seen
    shutdown_rx: watch::Receiver<bool>,
}

/// Result of [`WebSocketServer::connect`]
pub enum ConnectOutcome<T> {
    Accepted(Upgraded<T>),
    /// The status response has been written and the transport shut down
    Rejected(HandshakeRejection),
}

impl<T> ConnectOutcome<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Self::Accepted(upgraded) => Some(&upgraded.connection),
            Self::Rejected(_) => None,
        }
    }
}

struct Shared {
    config: ServerConfig,
    validator: HandshakeValidator,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    shutting_down: watch::Sender<bool>,
}

/// Outcome of reading the opening handshake off a fresh stream
enum HandshakeRead {
    Complete { head: String, rest: Vec<u8> },
    TooLarge,
}

/// What woke the read loop
enum ReadEvent {
    Data(io::Result<usize>),
    TimedOut,
    Closed,
    Shutdown,
}

/// WebSocket server
#[derive(Clone)]
pub struct WebSocketServer {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a server with its own connection registry
    ///
    /// Fails if the configuration does not validate.
    pub fn new(
        config: ServerConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ConfigError> {
        Self::with_registry(config, Arc::new(ConnectionRegistry::new()), handler)
    }

    /// Create a server sharing an existing registry, e.g. with a handler
    /// that broadcasts through it
    pub fn with_registry(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ConfigError> {
        let services = config.validate()?;
        let validator =
            HandshakeValidator::new(config.hostname.clone(), services, &config.allowed_origins);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutting_down, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                validator,
                registry,
                handler,
                shutting_down,
            }),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(Arc::clone(&self.shared.registry))
    }

    /// Get a shutdown signal receiver (for external components to listen for shutdown)
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    ///
    /// Stops the accept loop, drops handshakes still in progress and closes
    /// every open connection with 1001. Connections upgraded afterwards are
    /// closed with 1001 as soon as they are served.
    pub fn shutdown(&self) {
        self.shared.shutting_down.send_replace(true);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shared.shutting_down.borrow()
    }

    /// Bind the configured address and run the accept loop
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.shared.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.run_on(listener).await
    }

    /// Run the accept loop on an already bound listener
    ///
    /// Returns once [`Self::shutdown`] is called and the connection tasks
    /// have finished, or after a grace period that aborts the stragglers.
    pub async fn run_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "WebSocket server listening");

        let mut shutdown_rx = self.shared.shutting_down.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                            }
                            let server = self.clone();
                            tasks.spawn(async move {
                                let result = server.handle_transport(stream, Some(peer_addr)).await;
                                if let Err(e) = result {
                                    warn!(peer = %peer_addr, error = %e, "connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown_started(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            info!(open = tasks.len(), "waiting for connections to close");
            let drained = timeout(SHUTDOWN_GRACE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = tasks.len(), "aborting connections still open");
                tasks.abort_all();
            }
        }

        Ok(())
    }

    /// Run the handshake and, once accepted, the read loop for one stream
    pub async fn handle_transport<T: Transport>(
        &self,
        mut transport: T,
        peer_addr: Option<SocketAddr>,
    ) -> io::Result<()> {
        let mut shutdown_rx = self.shared.shutting_down.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let accept_timeout = self.shared.config.accept_timeout;
        let read = async {
            match accept_timeout {
                Some(limit) => timeout(limit, read_handshake(&mut transport)).await.ok(),
                None => Some(read_handshake(&mut transport).await),
            }
        };
        let handshake = tokio::select! {
            result = read => result,
            _ = shutdown_started(&mut shutdown_rx) => {
                debug!(peer = ?peer_addr, "shutdown during handshake, dropping stream");
                return Ok(());
            }
        };
        let handshake = match handshake {
            Some(result) => result?,
            None => {
                warn!(peer = ?peer_addr, "handshake timed out");
                return Ok(());
            }
        };

        let (head, rest) = match handshake {
            HandshakeRead::Complete { head, rest } => (head, rest),
            HandshakeRead::TooLarge => {
                let rejection = HandshakeRejection::MalformedRequestLine;
                warn!(peer = ?peer_addr, limit = MAX_HANDSHAKE_LEN, "handshake too large");
                transport.write_all(&rejection.response_bytes()).await?;
                transport.shutdown().await?;
                return Ok(());
            }
        };

        match self.connect(&head, transport, peer_addr).await? {
            ConnectOutcome::Accepted(mut upgraded) => {
                upgraded.buffer = rest;
                self.serve(upgraded).await;
            }
            ConnectOutcome::Rejected(_) => {}
        }
        Ok(())
    }

    /// Validate a raw handshake and upgrade `transport` on success
    ///
    /// A rejection is not an error: the status response is written, the
    /// transport is shut down and [`ConnectOutcome::Rejected`] is returned.
    /// Errors only come from failing to write the upgrade response.
    pub async fn connect<T: Transport>(
        &self,
        raw_handshake: &str,
        transport: T,
        peer_addr: Option<SocketAddr>,
    ) -> io::Result<ConnectOutcome<T>> {
        let (reader, mut writer) = tokio::io::split(transport);

        let handshake = match self.shared.validator.validate_raw(raw_handshake) {
            Ok(handshake) => handshake,
            Err(rejection) => {
                warn!(
                    peer = ?peer_addr,
                    status = rejection.status(),
                    %rejection,
                    "handshake rejected"
                );
                let written = async {
                    writer.write_all(&rejection.response_bytes()).await?;
                    writer.flush().await?;
                    writer.shutdown().await
                }
                .await;
                if let Err(e) = written {
                    debug!(peer = ?peer_addr, error = %e, "failed to write rejection");
                }
                return Ok(ConnectOutcome::Rejected(rejection));
            }
        };

        let response = handshake.response_bytes();
        let connection = Connection::with_write_timeout(
            handshake,
            peer_addr,
            Box::new(writer),
            Arc::clone(&self.shared.registry),
            self.shared.config.write_timeout,
        );

        if let Err(e) = connection.write_raw(&response).await {
            connection
                .release(CloseCode::Other(1006), "upgrade response failed")
                .await;
            return Err(match e {
                ConnectionError::Transport(e) => e,
                other => io::Error::new(io::ErrorKind::BrokenPipe, other.to_string()),
            });
        }

        let shutdown_rx = self.shared.shutting_down.subscribe();
        connection.mark_open();
        self.shared.registry.add(&connection).await;
        info!(
            conn_id = %connection.id(),
            peer = ?peer_addr,
            service = connection.service(),
            path = connection.path(),
            "connection opened"
        );

        Ok(ConnectOutcome::Accepted(Upgraded {
            connection,
            reader,
            buffer: Vec::new(),
            shutdown_rx,
        }))
    }

    /// Send one frame to a connection
    pub async fn send(
        &self,
        connection: &Connection,
        opcode: Opcode,
        payload: &[u8],
    ) -> ConnectionResult<bool> {
        connection.send(opcode, payload).await
    }

    /// Run the closing handshake on a connection
    pub async fn disconnect(
        &self,
        connection: &Connection,
        code: impl Into<CloseCode>,
        reason: &str,
    ) -> ConnectionResult<()> {
        connection.disconnect(code, reason).await
    }

    /// Read loop for an upgraded connection
    ///
    /// Returns after the connection has closed and `on_close` has run.
    pub async fn serve<T: Transport>(&self, upgraded: Upgraded<T>) {
        let Upgraded {
            connection,
            mut reader,
            mut buffer,
            mut shutdown_rx,
        } = upgraded;
        let handler = Arc::clone(&self.shared.handler);
        let max_frame_size = self.shared.config.max_frame_size;
        let read_timeout = self.shared.config.read_timeout;

        let mut state_rx = connection.subscribe_state();
        let mut chunk = vec![0u8; READ_CHUNK];

        handler.on_open(&connection).await;

        'read: loop {
            // Dispatch every complete frame already buffered
            loop {
                let len = match frame_len(&buffer, max_frame_size) {
                    Ok(Some(len)) if buffer.len() >= len => len,
                    Ok(_) => break,
                    Err(e) => {
                        protocol_failure(&connection, &e).await;
                        break 'read;
                    }
                };
                let decoded = decode_with_limit(&buffer[..len], max_frame_size);
                buffer.drain(..len);
                match decoded {
                    Ok((frame, _)) => {
                        if !dispatch(&connection, handler.as_ref(), frame).await {
                            break 'read;
                        }
                    }
                    Err(e) => {
                        protocol_failure(&connection, &e).await;
                        break 'read;
                    }
                }
            }

            let event = tokio::select! {
                event = read_chunk(&mut reader, &mut chunk, read_timeout) => event,
                _ = async {
                    let _ = state_rx.wait_for(|state| state.is_terminating()).await;
                } => ReadEvent::Closed,
                _ = shutdown_started(&mut shutdown_rx) => ReadEvent::Shutdown,
            };

            match event {
                ReadEvent::Data(Ok(0)) => {
                    connection
                        .release(CloseCode::Other(1006), "peer closed transport")
                        .await;
                    break;
                }
                ReadEvent::Data(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
                ReadEvent::Data(Err(e)) => {
                    debug!(conn_id = %connection.id(), error = %e, "read failed");
                    connection
                        .release(CloseCode::Other(1006), "transport error")
                        .await;
                    break;
                }
                ReadEvent::TimedOut => {
                    debug!(conn_id = %connection.id(), "read timed out");
                    close(&connection, CloseCode::GoingAway, "read timeout").await;
                    break;
                }
                ReadEvent::Closed => break,
                ReadEvent::Shutdown => {
                    close(&connection, CloseCode::GoingAway, SHUTDOWN_REASON).await;
                    break;
                }
            }
        }

        // A disconnect from another task may still be flushing its close frame
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;

        let reason = connection
            .close_reason()
            .await
            .unwrap_or_else(|| CloseReason::new(CloseCode::Other(1006), ""));
        handler.on_close(&connection, &reason).await;
    }
}

/// Handle one decoded frame; false once the connection is done
async fn dispatch(
    connection: &Arc<Connection>,
    handler: &dyn ConnectionHandler,
    frame: Frame,
) -> bool {
    debug!(
        conn_id = %connection.id(),
        opcode = ?frame.opcode,
        len = frame.payload.len(),
        "received frame"
    );

    match frame.opcode {
        Opcode::Text => match String::from_utf8(frame.payload) {
            Ok(text) => {
                handler.on_message(connection, Message::Text(text)).await;
                connection.is_open()
            }
            Err(_) => {
                close(connection, CloseCode::InvalidPayload, "invalid UTF-8").await;
                false
            }
        },
        Opcode::Binary => {
            handler
                .on_message(connection, Message::Binary(frame.payload))
                .await;
            connection.is_open()
        }
        Opcode::Ping => connection.send(Opcode::Pong, &frame.payload).await.is_ok(),
        Opcode::Pong => true,
        Opcode::Close => {
            match CloseReason::parse(&frame.payload) {
                Ok(peer) => {
                    let code = peer.reply_code();
                    let code = if code.is_sendable() {
                        code
                    } else {
                        CloseCode::ProtocolError
                    };
                    debug!(conn_id = %connection.id(), %peer, "peer initiated close");
                    connection.record_close_reason(peer).await;
                    close(connection, code, "").await;
                }
                Err(e) => {
                    close(connection, CloseCode::ProtocolError, &e.to_string()).await;
                }
            }
            false
        }
        // Never produced by the decoder
        Opcode::Continuation => {
            close(connection, CloseCode::ProtocolError, "unexpected continuation").await;
            false
        }
    }
}

/// Close after an undecodable frame
async fn protocol_failure(connection: &Connection, error: &FrameError) {
    warn!(conn_id = %connection.id(), error = %error, "protocol error");
    let code = match error {
        FrameError::FrameTooLarge { .. } => CloseCode::MessageTooBig,
        _ => CloseCode::ProtocolError,
    };
    close(connection, code, &error.to_string()).await;
}

async fn close(connection: &Connection, code: CloseCode, reason: &str) {
    if let Err(e) = connection.disconnect(code, reason).await {
        debug!(conn_id = %connection.id(), error = %e, "connection already closing");
    }
}

/// Resolves once shutdown has begun, including before the call
async fn shutdown_started(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|down| *down).await;
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    chunk: &mut [u8],
    read_timeout: Option<Duration>,
) -> ReadEvent {
    match read_timeout {
        Some(limit) => match timeout(limit, reader.read(chunk)).await {
            Ok(result) => ReadEvent::Data(result),
            Err(_) => ReadEvent::TimedOut,
        },
        None => ReadEvent::Data(reader.read(chunk).await),
    }
}

/// Read up to and including the blank line ending the header block
async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<HandshakeRead> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = header_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(HandshakeRead::Complete {
                head: String::from_utf8_lossy(&buf).into_owned(),
                rest,
            });
        }
        if buf.len() >= MAX_HANDSHAKE_LEN {
            return Ok(HandshakeRead::TooLarge);
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed during handshake",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .filter(|end| *end <= MAX_HANDSHAKE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{apply_mask, encode};
    use crate::server::handler::EchoHandler;
    use async_trait::async_trait;
    use tokio::io::duplex;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn config() -> ServerConfig {
        ServerConfig::new("127.0.0.1", 0, "localhost")
            .with_service("/chat")
            .with_service("/rooms/{id}")
    }

    fn request(target: &str) -> String {
        format!(
            "GET {target} HTTP/1.1\r\n\
             Host: localhost:9000\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
    }

    /// Masked client frame
    fn masked(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut frame = encode(opcode, payload).unwrap();
        let header = frame.len() - payload.len();
        frame[1] |= 0x80;
        let mut body = frame.split_off(header);
        apply_mask(&mut body, key);
        frame.extend_from_slice(&key);
        frame.extend_from_slice(&body);
        frame
    }

    /// Handler that reports every close it sees
    struct CloseRecorder {
        closes: mpsc::UnboundedSender<CloseReason>,
    }

    #[async_trait]
    impl ConnectionHandler for CloseRecorder {
        async fn on_message(&self, connection: &Arc<Connection>, message: Message) {
            let _ = connection
                .send(message.opcode(), message.as_bytes())
                .await;
        }

        async fn on_close(&self, _connection: &Arc<Connection>, reason: &CloseReason) {
            let _ = self.closes.send(reason.clone());
        }
    }

    async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            reader.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn start(config: ServerConfig) -> (WebSocketServer, SocketAddr, JoinHandle<()>) {
        start_with(config, Arc::new(EchoHandler)).await
    }

    async fn start_with(
        config: ServerConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (WebSocketServer, SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = WebSocketServer::new(config, handler).unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server.run_on(listener).await.unwrap();
            })
        };
        (server, addr, task)
    }

    async fn open_client(addr: SocketAddr, target: &str) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request(target).as_bytes()).await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
        client
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = ServerConfig::new("localhost", 9000, "localhost").with_service("/chat");
        assert!(matches!(
            WebSocketServer::new(config, Arc::new(EchoHandler)),
            Err(ConfigError::InvalidBindAddress(_))
        ));

        let config = ServerConfig::new("127.0.0.1", 9000, "localhost");
        assert!(matches!(
            WebSocketServer::new(config, Arc::new(EchoHandler)),
            Err(ConfigError::NoServices)
        ));
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn test_connect_accepts_chat() {
        let server = WebSocketServer::new(config(), Arc::new(EchoHandler)).unwrap();
        let (transport, mut client) = duplex(4096);

        let outcome = server.connect(&request("/chat"), transport, None).await.unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(server.registry().len().await, 1);
        let connection = outcome.connection().unwrap();
        assert!(connection.is_open());
        assert_eq!(connection.service(), "/chat");

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"));
        assert!(head.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")));
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
    }

    #[tokio::test]
    async fn test_connect_exposes_captures_and_params() {
        let server = WebSocketServer::new(config(), Arc::new(EchoHandler)).unwrap();
        let (transport, _client) = duplex(4096);

        let outcome = server
            .connect(&request("/rooms/42?user=ada%20l"), transport, None)
            .await
            .unwrap();
        let connection = outcome.connection().unwrap();
        assert_eq!(connection.service(), "/rooms/{id}");
        assert_eq!(connection.capture("id"), Some("42"));
        assert_eq!(connection.param("user"), Some("ada l"));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_service() {
        let server = WebSocketServer::new(config(), Arc::new(EchoHandler)).unwrap();
        let (transport, mut client) = duplex(4096);

        let outcome = server
            .connect(&request("/chatroom"), transport, None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ConnectOutcome::Rejected(HandshakeRejection::UnknownService)
        ));
        assert!(server.registry().is_empty().await);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_forbidden_origin() {
        let config = config().with_allowed_origin("https://example.com");
        let server = WebSocketServer::new(config, Arc::new(EchoHandler)).unwrap();
        let (transport, mut client) = duplex(4096);

        let outcome = server.connect(&request("/chat"), transport, None).await.unwrap();
        assert!(!outcome.is_accepted());

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 403 Forbidden"));
    }

    #[tokio::test]
    async fn test_disconnect_then_send_fails() {
        let server = WebSocketServer::new(config(), Arc::new(EchoHandler)).unwrap();
        let (transport, mut client) = duplex(4096);
        let outcome = server.connect(&request("/chat"), transport, None).await.unwrap();
        let connection = Arc::clone(outcome.connection().unwrap());
        read_head(&mut client).await;

        server.disconnect(&connection, 1000u16, "bye").await.unwrap();
        assert!(server.registry().is_empty().await);
        assert!(matches!(
            server.send(&connection, Opcode::Text, b"late").await,
            Err(ConnectionError::ConnectionClosed)
        ));

        let mut close = [0u8; 7];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']);
    }

    #[tokio::test]
    async fn test_oversized_handshake_rejected() {
        let server = WebSocketServer::new(config(), Arc::new(EchoHandler)).unwrap();
        let (transport, mut client) = duplex(64 * 1024);

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_transport(transport, None).await })
        };

        let junk = format!("GET /chat HTTP/1.1\r\nX-Pad: {}\r\n", "a".repeat(MAX_HANDSHAKE_LEN));
        client.write_all(junk.as_bytes()).await.unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 400 Bad Request"));
        task.await.unwrap().unwrap();
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_echo_over_tcp() {
        let (server, addr, task) = start(config()).await;
        let mut client = open_client(addr, "/chat").await;

        client
            .write_all(&masked(Opcode::Text, b"hello"))
            .await
            .unwrap();
        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"\x81\x05hello");

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_pipelined_with_handshake() {
        let (server, addr, task) = start(config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut bytes = request("/chat").into_bytes();
        bytes.extend_from_slice(&masked(Opcode::Binary, &[1, 2, 3]));
        client.write_all(&bytes).await.unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"));
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x82, 0x03, 1, 2, 3]);

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (server, addr, task) = start(config()).await;
        let mut client = open_client(addr, "/chat").await;

        client
            .write_all(&masked(Opcode::Ping, b"are you there"))
            .await
            .unwrap();
        let mut reply = [0u8; 15];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x8A);
        assert_eq!(reply[1], 13);
        assert_eq!(&reply[2..], b"are you there");

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed() {
        let (closes_tx, mut closes) = mpsc::unbounded_channel();
        let handler = Arc::new(CloseRecorder { closes: closes_tx });
        let (server, addr, task) = start_with(config(), handler).await;
        let mut client = open_client(addr, "/chat").await;

        let payload = CloseReason::new(CloseCode::Normal, "done").encode();
        client
            .write_all(&masked(Opcode::Close, &payload))
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0x88, 0x02, 0x03, 0xE8]);

        let reason = closes.recv().await.unwrap();
        assert_eq!(reason, CloseReason::new(CloseCode::Normal, "done"));
        assert!(server.registry().is_empty().await);

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_with_protocol_error() {
        let (server, addr, task) = start(config()).await;
        let mut client = open_client(addr, "/chat").await;

        client.write_all(b"\x81\x02hi").await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x88);
        assert_eq!(&reply[2..4], &1002u16.to_be_bytes());

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_with_1007() {
        let (server, addr, task) = start(config()).await;
        let mut client = open_client(addr, "/chat").await;

        client
            .write_all(&masked(Opcode::Text, &[0xff, 0xfe]))
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x88);
        assert_eq!(&reply[2..4], &1007u16.to_be_bytes());

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_with_1009() {
        let (server, addr, task) = start(config().with_max_frame_size(16)).await;
        let mut client = open_client(addr, "/chat").await;

        client
            .write_all(&masked(Opcode::Binary, &[0u8; 32]))
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply[2..4], &1009u16.to_be_bytes());

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_closes_with_going_away() {
        let config = config().with_read_timeout(Some(Duration::from_millis(100)));
        let (server, addr, task) = start(config).await;
        let mut client = open_client(addr, "/chat").await;

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let mut expected = vec![0x88, 14, 0x03, 0xE9];
        expected.extend_from_slice(b"read timeout");
        assert_eq!(reply, expected);

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (closes_tx, mut closes) = mpsc::unbounded_channel();
        let handler = Arc::new(CloseRecorder { closes: closes_tx });
        let (server, addr, task) = start_with(config(), handler).await;
        let mut client = open_client(addr, "/chat").await;

        // Wait until the connection task has registered
        while server.registry().is_empty().await {
            tokio::task::yield_now().await;
        }
        server.shutdown();
        task.await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply[2..4], &1001u16.to_be_bytes());
        assert_eq!(&reply[4..], SHUTDOWN_REASON.as_bytes());

        let reason = closes.recv().await.unwrap();
        assert_eq!(reason.code, CloseCode::GoingAway);
    }

    #[tokio::test]
    async fn test_shutdown_mid_handshake_refuses_upgrade() {
        let (server, addr, task) = start(config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let bytes = request("/chat").into_bytes();
        let (head, rest) = bytes.split_at(bytes.len() / 2);
        client.write_all(head).await.unwrap();

        // Let the server pick up the partial request
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        let _ = client.write_all(rest).await;
        let mut reply = Vec::new();
        let _ = client.read_to_end(&mut reply).await;
        assert!(!String::from_utf8_lossy(&reply).contains("101"), "{reply:?}");
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_upgrade_after_shutdown_closes_with_going_away() {
        let server = WebSocketServer::new(config(), Arc::new(EchoHandler)).unwrap();
        server.shutdown();
        assert!(server.is_shutting_down());

        let (transport, mut client) = duplex(4096);
        let outcome = server.connect(&request("/chat"), transport, None).await.unwrap();
        let ConnectOutcome::Accepted(upgraded) = outcome else {
            panic!("upgrade should succeed");
        };
        timeout(Duration::from_secs(2), server.serve(upgraded))
            .await
            .unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x88);
        assert_eq!(&reply[2..4], &1001u16.to_be_bytes());
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_silent_client_hits_accept_timeout() {
        let config = config().with_accept_timeout(Some(Duration::from_millis(100)));
        let server = WebSocketServer::new(config, Arc::new(EchoHandler)).unwrap();
        let (transport, mut client) = duplex(4096);

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_transport(transport, None).await })
        };
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_peer_close_with_no_status_code_is_protocol_error() {
        let (server, addr, task) = start(config()).await;
        let mut client = open_client(addr, "/chat").await;

        client
            .write_all(&masked(Opcode::Close, &1005u16.to_be_bytes()))
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0x88, 0x02, 0x03, 0xEA]);

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_releases_connection() {
        let (closes_tx, mut closes) = mpsc::unbounded_channel();
        let handler = Arc::new(CloseRecorder { closes: closes_tx });
        let (server, addr, task) = start_with(config(), handler).await;
        let client = open_client(addr, "/chat").await;
        drop(client);

        let reason = closes.recv().await.unwrap();
        assert_eq!(reason.code, CloseCode::Other(1006));
        assert!(server.registry().is_empty().await);

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_over_tcp() {
        let (server, addr, task) = start(config()).await;
        let mut first = open_client(addr, "/chat").await;
        let mut second = open_client(addr, "/rooms/7").await;

        while server.registry().len().await < 2 {
            tokio::task::yield_now().await;
        }
        let report = server.broadcaster().broadcast_text("all").await.unwrap();
        assert_eq!(report.delivered, 2);

        for client in [&mut first, &mut second] {
            let mut frame = [0u8; 5];
            client.read_exact(&mut frame).await.unwrap();
            assert_eq!(&frame, b"\x81\x03all");
        }

        server.shutdown();
        task.await.unwrap();
    }
}
