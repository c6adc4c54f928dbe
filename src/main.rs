#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # edgewire
//!
//! Reverse WebSocket tunnel between a fleet manager and edge agents.
//!
//! Edge agents sit behind NAT and cannot be reached directly, so each agent
//! dials the manager once and keeps the socket open. The manager then proxies
//! HTTP requests and WebSocket streams into the agent over that socket.
//!
//! ## Subcommands
//!
//! - `edgewire manager` (default): accept agent tunnels and proxy into them
//! - `edgewire agent`: serve the local API and keep a tunnel to the manager
//!
//! See [`edgewire::routes`] for the HTTP surface of each role.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use edgewire::config::Config;
use edgewire::routes;
use edgewire::state::{AgentState, ManagerState};
use edgewire::tunnel::{
    spawn_stale_sweep, LoggingStatusReporter, StaticTokenResolver, TunnelClient, TunnelRegistry,
    TunnelServer, TunnelStats,
};

/// Reverse WebSocket tunnel between a fleet manager and edge agents.
#[derive(Parser)]
#[command(name = "edgewire", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agent tunnels and proxy into them (default).
    Manager {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Serve the local API and keep a tunnel open to the manager.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Agent { config }) => run_agent(config.as_deref()).await,
        Some(Commands::Manager { config }) => run_manager(config.as_deref()).await,
        None => run_manager(None).await,
    };
    if let Err(e) = result {
        eprintln!("edgewire: {e}");
        std::process::exit(1);
    }
}

fn load_config(config_path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Ok(config)
}

async fn run_manager(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(load_config(config_path)?);

    info!("edgewire v{} starting as manager", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set EDGEWIRE_API_KEY or update config");
    }
    if config.manager.agent_tokens.is_empty() {
        warn!("No agent tokens configured, every agent connect will be rejected");
    }

    let registry = TunnelRegistry::new();
    let server = TunnelServer::new(
        registry.clone(),
        Arc::new(StaticTokenResolver::new(config.manager.agent_tokens.clone())),
        Arc::new(LoggingStatusReporter),
    );
    let state = ManagerState::new(config.clone(), registry.clone());
    let app = routes::manager_router(state, &server).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Manager ready");

    let cancel = CancellationToken::new();
    let sweep_task = spawn_stale_sweep(
        registry.clone(),
        config.manager.sweep_interval(),
        config.manager.heartbeat_timeout(),
        cancel.clone(),
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    cancel.cancel();
    let _ = sweep_task.await;
    registry.close_all().await;
    info!("Goodbye");
    Ok(())
}

async fn run_agent(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(load_config(config_path)?);

    info!("edgewire v{} starting as agent", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let stats = Arc::new(TunnelStats::new());
    let router = routes::agent_router(AgentState::new(config.clone(), stats.clone()));

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Agent ready");

    let cancel = CancellationToken::new();
    let tunnel_task = if config.agent.manager_url.is_empty() {
        warn!("No manager_url configured, tunnel disabled");
        None
    } else {
        info!("Tunnel enabled, will connect to {}", config.agent.manager_url);
        let client_config = config.agent.client_config(&config.server.listen);
        let client = TunnelClient::new(client_config, router.clone(), stats);
        Some(client.spawn(cancel.clone()))
    };

    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    cancel.cancel();
    if let Some(task) = tunnel_task {
        if let Err(e) = task.await {
            error!("Tunnel client task failed: {e}");
        }
    }
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
