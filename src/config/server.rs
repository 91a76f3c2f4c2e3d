//! Server configuration
//!
//! Built in code or loaded from a TOML file such as:
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 9000
//! hostname = "chat.example.com"
//! services = ["/chat", "/rooms/{room}"]
//! allowed_origins = ["https://chat.example.com"]
//! read_timeout_secs = 300
//! accept_timeout_secs = 10
//! write_timeout_secs = 10
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{PatternError, ServicePattern};

/// Default cap on inbound frame payloads (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Ports below this are well-known and refused
const FIRST_UNRESERVED_PORT: u16 = 1024;

/// Errors that can occur while building or loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("Port {0} is reserved")]
    ReservedPort(u16),
    #[error("Hostname cannot be empty")]
    EmptyHostname,
    #[error("At least one service must be configured")]
    NoServices,
    #[error("Invalid service: {0}")]
    InvalidService(#[from] PatternError),
    #[error("Max frame size must be greater than zero")]
    ZeroFrameSize,
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// On-disk representation
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(default = "default_bind")]
    bind: String,
    port: u16,
    hostname: String,
    services: Vec<String>,
    #[serde(default)]
    allowed_origins: Vec<String>,
    /// Required so deployments state their idle policy; 0 disables
    read_timeout_secs: u64,
    #[serde(default)]
    accept_timeout_secs: Option<u64>,
    #[serde(default)]
    write_timeout_secs: Option<u64>,
    #[serde(default = "default_max_frame_size")]
    max_frame_size: usize,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

/// Configuration for the WebSocket server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Hostname the `Host` header must name
    pub hostname: String,
    /// Accepted endpoint patterns, tried in order
    pub services: Vec<String>,
    /// Allowed `Origin` values; empty allows all
    pub allowed_origins: Vec<String>,
    /// Idle limit on reads from an open connection
    pub read_timeout: Option<Duration>,
    /// Limit on receiving the opening handshake after accept
    pub accept_timeout: Option<Duration>,
    /// Limit on a single frame write before the connection is released
    pub write_timeout: Option<Duration>,
    /// Largest inbound frame payload
    pub max_frame_size: usize,
}

impl ServerConfig {
    /// Create a new server configuration with no services
    pub fn new(bind: impl Into<String>, port: u16, hostname: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            port,
            hostname: hostname.into(),
            services: Vec::new(),
            allowed_origins: Vec::new(),
            read_timeout: None,
            accept_timeout: None,
            write_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Add a service pattern
    pub fn with_service(mut self, pattern: impl Into<String>) -> Self {
        self.services.push(pattern.into());
        self
    }

    /// Replace the service patterns
    pub fn with_services<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Add an allowed origin
    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Replace the allowed origins
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the handshake (accept) timeout
    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the per-write timeout
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the inbound frame size limit
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(Self {
            bind: file.bind,
            port: file.port,
            hostname: file.hostname,
            services: file.services,
            allowed_origins: file.allowed_origins,
            read_timeout: secs_to_timeout(file.read_timeout_secs),
            accept_timeout: file.accept_timeout_secs.and_then(secs_to_timeout),
            write_timeout: file.write_timeout_secs.and_then(secs_to_timeout),
            max_frame_size: file.max_frame_size,
        })
    }

    /// Check every field, returning the compiled service patterns
    pub fn validate(&self) -> Result<Vec<ServicePattern>, ConfigError> {
        self.bind_ip()?;
        if (1..FIRST_UNRESERVED_PORT).contains(&self.port) {
            return Err(ConfigError::ReservedPort(self.port));
        }
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        self.services
            .iter()
            .map(|s| ServicePattern::parse(s).map_err(ConfigError::from))
            .collect()
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind.clone()))
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }
}

fn secs_to_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
