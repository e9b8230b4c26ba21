//! FluxTerm Gateway
//!
//! Single binary that runs:
//! - WebSocket session endpoint bridging browser terminals to serial
//!   devices and remote shells, with XMODEM file transfer
//! - REST API for the serial device catalog
//! - Optional static file server for the web client

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fluxterm_gateway::config::GatewayConfig;
use fluxterm_gateway::origin::OriginPolicy;
use fluxterm_gateway::state::AppState;

/// FluxTerm terminal gateway.
#[derive(Parser, Debug)]
#[command(name = "fluxterm-gateway", about = "FluxTerm terminal gateway")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: SocketAddr,

    /// TOML file with session, transport and transfer tunables.
    #[arg(long, env = "FLUXTERM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the built web client (served with SPA fallback).
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Browser origin allowed to open sessions. Repeatable.
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Accept WebSocket upgrades from any origin.
    #[arg(long, default_value_t = false)]
    allow_any_origin: bool,

    /// Write logs to this file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Logging ─────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    // ── Config ──────────────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.origin.allowed.extend(cli.allowed_origins.iter().cloned());
    config.origin.allow_any |= cli.allow_any_origin;
    let origin = OriginPolicy::from_settings(&config.origin);
    if origin == OriginPolicy::AllowAny {
        tracing::warn!("accepting WebSocket upgrades from any origin");
    }

    // ── Shared state ────────────────────────────────────────────
    let state = AppState::with_system_backends(config, origin);

    // ── Router ──────────────────────────────────────────────────
    let mut app = fluxterm_gateway::app(state.clone());
    if let Some(dir) = &cli.static_dir {
        let spa_fallback = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).not_found_service(spa_fallback));
    }
    let app = app.layer(TraceLayer::new_for_http());

    // ── Listen ──────────────────────────────────────────────────
    tracing::info!(addr = %cli.listen_addr, "fluxterm-gateway listening");
    let listener = tokio::net::TcpListener::bind(cli.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            // Upgraded sockets only finish once their sessions stop.
            state.shutdown().await;
        })
        .await?;

    Ok(())
}
