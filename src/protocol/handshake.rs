//! Opening handshake (RFC 6455 Section 4)
//!
//! Parses the request line and header block of a client upgrade request and
//! validates it against the server's hostname, service patterns and origin
//! allow-list.
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use percent_encoding::percent_decode_str;
use sha1::{Digest, Sha1};
use thiserror::Error;

use super::service::ServicePattern;

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this endpoint speaks
pub const WS_VERSION: &str = "13";

/// Decoded length of a valid `Sec-WebSocket-Key`
const KEY_LEN: usize = 16;

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

// ============================================================================
// Rejections
// ============================================================================

/// Reasons a handshake is refused, in validation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HandshakeRejection {
    #[error("Malformed request line")]
    MalformedRequestLine,

    #[error("Host header does not match server hostname")]
    HostMismatch,

    #[error("Missing or invalid Upgrade/Connection headers")]
    UpgradeRequired,

    #[error("Missing or invalid Sec-WebSocket-Key")]
    BadSecWebSocketKey,

    #[error("Unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,

    #[error("No service registered for the requested endpoint")]
    UnknownService,

    #[error("Origin not allowed")]
    OriginForbidden,
}

impl HandshakeRejection {
    /// HTTP status code written back to the client
    pub fn status(self) -> u16 {
        match self {
            Self::MalformedRequestLine
            | Self::HostMismatch
            | Self::UpgradeRequired
            | Self::BadSecWebSocketKey
            | Self::UnsupportedVersion => 400,
            Self::UnknownService => 404,
            Self::OriginForbidden => 403,
        }
    }

    /// HTTP reason phrase for [`Self::status`]
    pub fn reason_phrase(self) -> &'static str {
        match self.status() {
            403 => "Forbidden",
            404 => "Not Found",
            _ => "Bad Request",
        }
    }

    /// Status response closing the transport
    pub fn response_bytes(self) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {} {}\r\nConnection: close\r\n",
            self.status(),
            self.reason_phrase()
        );
        if self == Self::UnsupportedVersion {
            response.push_str("Sec-WebSocket-Version: ");
            response.push_str(WS_VERSION);
            response.push_str("\r\n");
        }
        response.push_str("\r\n");
        response.into_bytes()
    }
}

// ============================================================================
// Request
// ============================================================================

/// Request line and headers of a client upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    /// Path plus optional `?query`
    pub target: String,
    pub version: String,
    /// Header values keyed by lowercase name
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Build a request from already-parsed parts
    pub fn new(
        method: impl Into<String>,
        target: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: version.into(),
            headers: HashMap::new(),
        }
    }

    /// Add a header; repeated names are joined with `", "`
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value.into());
        self
    }

    fn insert_header(&mut self, name: &str, value: String) {
        self.headers
            .entry(name.trim().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    /// Parse raw handshake text up to the blank line
    pub fn parse(raw: &str) -> Result<Self, HandshakeRejection> {
        let mut lines = raw.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let fields = (parts.next(), parts.next(), parts.next(), parts.next());
        let (method, target, version) = match fields {
            (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
            _ => return Err(HandshakeRejection::MalformedRequestLine),
        };

        let mut request = Self::new(method, target, version);
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(HandshakeRejection::MalformedRequestLine)?;
            if name.trim().is_empty() {
                return Err(HandshakeRejection::MalformedRequestLine);
            }
            request.insert_header(name, value.trim().to_string());
        }

        Ok(request)
    }

    /// Header value by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Target path without the query string
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }
}

/// `HTTP/<digit>.<digit>`
fn is_http_version(version: &str) -> bool {
    match version.strip_prefix("HTTP/").map(str::as_bytes) {
        Some([major, b'.', minor]) => major.is_ascii_digit() && minor.is_ascii_digit(),
        _ => false,
    }
}

/// Host header with any port removed
fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Percent-decoded `key=value` pairs in query order
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

// ============================================================================
// Validation
// ============================================================================

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedHandshake {
    /// Value for `Sec-WebSocket-Accept`
    pub accept_key: String,
    /// Configured pattern that matched
    pub service: String,
    /// Request path without the query
    pub path: String,
    /// Raw query string
    pub query: Option<String>,
    /// Decoded query parameters
    pub params: Vec<(String, String)>,
    /// `{name}` segments captured by the service pattern
    pub captures: Vec<(String, String)>,
    /// `Origin` header, if sent
    pub origin: Option<String>,
}

impl AcceptedHandshake {
    /// First query parameter with the given name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `101 Switching Protocols` response
    pub fn response_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: {}\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            WS_VERSION, self.accept_key
        )
        .into_bytes()
    }
}

/// Validates client handshakes against static server configuration
#[derive(Debug, Clone)]
pub struct HandshakeValidator {
    hostname: String,
    services: Vec<ServicePattern>,
    /// Lowercased; empty allows every origin
    allowed_origins: Vec<String>,
}

impl HandshakeValidator {
    pub fn new(
        hostname: impl Into<String>,
        services: Vec<ServicePattern>,
        allowed_origins: &[String],
    ) -> Self {
        Self {
            hostname: hostname.into(),
            services,
            allowed_origins: allowed_origins
                .iter()
                .map(|o| o.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Parse and validate raw handshake text
    pub fn validate_raw(&self, raw: &str) -> Result<AcceptedHandshake, HandshakeRejection> {
        let request = HandshakeRequest::parse(raw)?;
        self.validate(&request)
    }

    /// Validate a parsed handshake; the first failing check decides the rejection
    pub fn validate(
        &self,
        request: &HandshakeRequest,
    ) -> Result<AcceptedHandshake, HandshakeRejection> {
        if request.method != "GET" || !is_http_version(&request.version) {
            return Err(HandshakeRejection::MalformedRequestLine);
        }

        match request.header("host") {
            Some(host) if host_without_port(host).eq_ignore_ascii_case(&self.hostname) => {}
            _ => return Err(HandshakeRejection::HostMismatch),
        }

        match request.header("upgrade") {
            Some(upgrade) if upgrade.eq_ignore_ascii_case("websocket") => {}
            _ => return Err(HandshakeRejection::UpgradeRequired),
        }

        match request.header("connection") {
            Some(connection) if connection.to_ascii_lowercase().contains("upgrade") => {}
            _ => return Err(HandshakeRejection::UpgradeRequired),
        }

        let key = request
            .header("sec-websocket-key")
            .ok_or(HandshakeRejection::BadSecWebSocketKey)?;
        match base64::engine::general_purpose::STANDARD.decode(key) {
            Ok(decoded) if decoded.len() == KEY_LEN => {}
            _ => return Err(HandshakeRejection::BadSecWebSocketKey),
        }

        if request.header("sec-websocket-version") != Some(WS_VERSION) {
            return Err(HandshakeRejection::UnsupportedVersion);
        }

        let path = request.path();
        let (service, captures) = self
            .services
            .iter()
            .find_map(|pattern| pattern.matches(path).map(|captures| (pattern, captures)))
            .ok_or(HandshakeRejection::UnknownService)?;

        let origin = request.header("origin");
        if !self.allowed_origins.is_empty() {
            match origin {
                Some(origin) if self.allowed_origins.contains(&origin.to_ascii_lowercase()) => {}
                _ => return Err(HandshakeRejection::OriginForbidden),
            }
        }

        let query = request.query();
        Ok(AcceptedHandshake {
            accept_key: compute_accept_key(key),
            service: service.as_str().to_string(),
            path: path.to_string(),
            query: query.map(str::to_string),
            params: query.map(parse_query).unwrap_or_default(),
            captures,
            origin: origin.map(str::to_string),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn services(&self) -> &[ServicePattern] {
        &self.services
    }
}

impl fmt::Display for AcceptedHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.path, self.service)
    }
}
