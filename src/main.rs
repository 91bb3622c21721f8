use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spotdb::config::{Config, ServerMode};
use spotdb::db::Database;
use spotdb::server::{self, AppState};
use spotdb::{mcp, socket};

/// Grace period for each listener during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// SpotDB — an ephemeral SQL sandbox serving DuckDB to AI agents over HTTP,
/// WebSocket, and MCP.
#[derive(Parser)]
#[command(name = "spotdb", version, about)]
struct Cli {}

fn init_tracing(mode: ServerMode) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if mode == ServerMode::Test {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let _cli = Cli::parse();

    let config = Arc::new(Config::from_env());
    init_tracing(config.server_mode);

    info!("starting SpotDB");
    if let Err(e) = run(config).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
    info!("shutdown complete");
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // May pull a snapshot from object storage; any failure there is fatal.
    let db = Arc::new(Database::open(&config).await?);
    info!("database initialized successfully");

    let http_addr: SocketAddr = ([0, 0, 0, 0], 8080).into();
    let mcp_addr: SocketAddr = ([0, 0, 0, 0], 8081).into();
    let socket_addr: SocketAddr = ([0, 0, 0, 0], config.socket_port).into();

    let state = AppState::new(Arc::clone(&db), Arc::clone(&config));
    let http_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = server::run_http_server(state, http_addr, cancel).await {
                error!(error = %e, "HTTP server error");
            }
        }
    });

    let mcp_task = tokio::spawn({
        let db = Arc::clone(&db);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        async move {
            if let Err(e) = mcp::run_mcp_server(db, config, mcp_addr, cancel).await {
                error!(error = %e, "MCP server error");
            }
        }
    });

    let socket_task = tokio::spawn({
        let db = Arc::clone(&db);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        async move {
            if let Err(e) = socket::run_socket_server(db, config, socket_addr, cancel).await {
                error!(error = %e, "socket server error");
            }
        }
    });

    info!("all services started successfully");
    wait_for_signal().await;
    info!("shutting down");

    cancel.cancel();
    for (name, task) in [
        ("http", http_task),
        ("mcp", mcp_task),
        ("socket", socket_task),
    ] {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!(listener = name, "listener did not stop within the grace period");
        }
    }

    if let Err(e) = db.close().await {
        warn!(error = %e, "error closing database");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
        _ = sigterm.recv() => info!("received terminate signal"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received interrupt signal");
}
