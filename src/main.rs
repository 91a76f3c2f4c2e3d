//! wsgate
//!
//! Standalone WebSocket endpoint. Relays each message to the other clients
//! of the same service, or echoes it back with `--echo`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wsgate::server::{Broadcaster, ConnectionHandler, EchoHandler, RelayHandler};
use wsgate::{ConnectionRegistry, ServerConfig, WebSocketServer};

/// wsgate WebSocket server
#[derive(Parser, Debug)]
#[command(name = "wsgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Hostname clients must send in the Host header
    #[arg(long)]
    hostname: Option<String>,

    /// Service path pattern, e.g. /chat or /rooms/{id} (repeatable)
    #[arg(long = "service")]
    services: Vec<String>,

    /// Allowed Origin (repeatable); any origin is accepted when none are given
    #[arg(long = "origin")]
    origins: Vec<String>,

    /// Seconds a connection may stay silent before it is closed (0 disables);
    /// required without --config
    #[arg(long, required_unless_present = "config")]
    read_timeout: Option<u64>,

    /// Seconds a single frame write may take before the connection is dropped
    /// (0 disables)
    #[arg(long)]
    write_timeout: Option<u64>,

    /// Echo messages back instead of relaying them
    #[arg(long)]
    echo: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// File configuration (or defaults) with flags applied on top
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::new("127.0.0.1", 9000, "localhost"),
        };

        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if !self.services.is_empty() {
            config.services = self.services.clone();
        }
        if !self.origins.is_empty() {
            config.allowed_origins = self.origins.clone();
        }
        if let Some(secs) = self.read_timeout {
            config.read_timeout = non_zero_secs(secs);
        }
        if let Some(secs) = self.write_timeout {
            config.write_timeout = non_zero_secs(secs);
        }

        Ok(config)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over -v
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("wsgate v{}", env!("CARGO_PKG_VERSION"));

    let config = args.server_config()?;
    let registry = Arc::new(ConnectionRegistry::new());
    let handler: Arc<dyn ConnectionHandler> = if args.echo {
        Arc::new(EchoHandler)
    } else {
        Arc::new(RelayHandler::new(Broadcaster::new(Arc::clone(&registry))))
    };

    info!(
        hostname = %config.hostname,
        services = ?config.services,
        origins = config.allowed_origins.len(),
        "starting server"
    );
    let server = Arc::new(
        WebSocketServer::with_registry(config, registry, handler)
            .context("invalid server configuration")?,
    );
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
