//! MCP Portal - unified gateway for Model Context Protocol servers.
//!
//! Discovers MCP servers declared across IDE configurations, multiplexes
//! their tools and resources behind a single endpoint, and exposes a live
//! management API.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use portal_core::config::PortalConfig;
use portal_core::discovery::Discovery;
use portal_server::{create_router, AppState};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit code for invalid configuration.
const EXIT_CONFIG_INVALID: u8 = 2;
/// Exit code when the listen port is taken.
const EXIT_PORT_IN_USE: u8 = 3;

#[derive(Parser)]
#[command(name = "mcp-portal")]
#[command(about = "MCP aggregation gateway", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Serve,

    /// Print discovered server declarations and exit
    Discover,

    /// Inspect or replace the manual configuration source
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the manual configuration document
    Get,

    /// Replace the manual configuration from a JSON file
    Set {
        /// Path to a JSON document with an `mcpServers` map
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = PortalConfig::from_env();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Discover => discover(&config),
        Commands::Config { action } => run_config(&config, action),
    }
}

async fn serve(config: PortalConfig) -> ExitCode {
    info!("starting MCP Portal v{}", env!("CARGO_PKG_VERSION"));

    let addr = config.bind_addr();
    let state = AppState::new(config);

    let discovered = state.bootstrap().await;
    info!(servers = discovered, "discovery complete");
    state.start_background_tasks();

    let app = create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(%addr, "port already in use");
            return ExitCode::from(EXIT_PORT_IN_USE);
        }
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!("listening on http://{addr}");

    let supervisor = state.supervisor.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("shutting down");
    supervisor.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn discover(config: &PortalConfig) -> ExitCode {
    let discovery = Discovery::new(config);
    let scan = discovery.scan();

    for (name, source) in &scan.dropped {
        eprintln!("warning: duplicate '{name}' from {} dropped", source.as_str());
    }
    for (path, reason) in &scan.errors {
        eprintln!("warning: {}: {reason}", path.display());
    }

    match serde_json::to_string_pretty(&scan.decls) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to render declarations");
            ExitCode::FAILURE
        }
    }
}

fn run_config(config: &PortalConfig, action: ConfigAction) -> ExitCode {
    let discovery = Discovery::new(config);
    match action {
        ConfigAction::Get => {
            let doc = discovery.read_manual();
            match serde_json::to_string_pretty(&doc) {
                Ok(rendered) => {
                    println!("{rendered}");
                    ExitCode::SUCCESS
                }
                Err(_) => ExitCode::FAILURE,
            }
        }
        ConfigAction::Set { path } => {
            let doc = match std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))
                .and_then(|text| {
                    serde_json::from_str(&text)
                        .with_context(|| format!("parsing {}", path.display()))
                }) {
                Ok(doc) => doc,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    return ExitCode::from(EXIT_CONFIG_INVALID);
                }
            };
            match discovery.write_manual(&doc) {
                Ok(count) => {
                    println!("manual source updated ({count} servers)");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(EXIT_CONFIG_INVALID)
                }
            }
        }
    }
}
