//! tmux Bridge Server
//!
//! Keeps terminal sessions alive in tmux across client disconnects and bridge
//! restarts, and streams them to WebSocket clients.

mod bridge;
mod config;
mod pty;
mod registry;
mod server;
mod session;
mod tmux;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bridge::{Bridge, RoomRegistry};
use config::{BridgeConfig, CONFIG_FILE};
use registry::{MetadataStore, RegistryError, SessionRegistry};
use server::{ServerConfig, ServerContext, WebSocketServer};
use tmux::{Multiplexer, TmuxAdapter};

/// tmux Bridge Server
///
/// WebSocket bridge for persistent tmux-backed terminal sessions
#[derive(Parser, Debug)]
#[command(name = "tmux-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let builder = FmtSubscriber::builder().with_target(false).compact();
    if std::env::var_os("RUST_LOG").is_some() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        let log_level = if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        builder.with_max_level(log_level).init();
    }

    info!("tmux bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(max_sessions) = args.max_sessions {
        config.max_sessions = max_sessions;
    }
    config.validate()?;

    let multiplexer: Arc<dyn Multiplexer> = Arc::new(TmuxAdapter::new(config.tmux_options()));
    let metadata = MetadataStore::open(config.metadata_path.clone());
    let registry = Arc::new(SessionRegistry::new(
        multiplexer,
        config.registry_options(),
        metadata,
    ));
    info!(max_sessions = registry.max_sessions(), "Session registry ready");

    match registry.discover().await {
        Ok(report) => info!(
            live = report.live,
            discovered = report.discovered,
            pruned = report.pruned,
            "Reconciled existing tmux sessions"
        ),
        Err(e) => warn!("Session discovery failed: {}", e),
    }

    let bridge = Arc::new(Bridge::new(Arc::new(RoomRegistry::new())));

    let default_cwd = std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(std::env::temp_dir);
    let server_config = ServerConfig::new(config.bind.clone(), config.port)
        .with_default_size(config.default_cols, config.default_rows)
        .with_default_cwd(default_cwd);

    let server = Arc::new(WebSocketServer::new(ServerContext::new(
        Arc::clone(&registry),
        Arc::clone(&bridge),
        server_config,
    )));

    // Periodic sweep of dead handles
    let cleanup = config.cleanup_interval().map(|interval| {
        let registry = Arc::clone(&registry);
        let mut stop = server.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_idle().await;
                        if removed > 0 {
                            info!("Cleaned up {} idle sessions", removed);
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        })
    });

    // Spawn shutdown signal handler
    let server_handle = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }
    bridge.shutdown().await;

    match registry.shutdown(config.shutdown_timeout()).await {
        Ok(summary) => info!(
            killed = summary.killed,
            detached = summary.detached,
            "Sessions released"
        ),
        Err(RegistryError::DeadlineExceeded(deadline)) => {
            error!("Shutdown did not finish within {:?}, forcing exit", deadline);
            std::process::exit(1);
        }
        Err(e) => warn!("Shutdown finished with errors: {}", e),
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
