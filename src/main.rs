//! Muxhaul - reverse TCP tunnel server
//!
//! Accepts a remote agent's control channel and tunnel connections, and
//! exposes the agent's services on local ports.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use muxhaul_server::{TcpMuxServer, TunnelConfig};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Muxhaul - expose a remote agent's services through multiplexed TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "muxhaul")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    #[command(long_about = r#"
Run the tunnel server. The agent connects to --bind, authenticates with the
shared token, and then carries traffic for every configured port mapping.

EXAMPLES:
  # Run from a config file
  muxhaul serve --config muxhaul.yaml

  # Override the listen address and mappings
  muxhaul serve --config muxhaul.yaml --bind 0.0.0.0:3080 \
    --port "8080=127.0.0.1:80" --port 2222

ENVIRONMENT VARIABLES:
  MUXHAUL_CONFIG  Path to the YAML config file
  MUXHAUL_BIND    Tunnel listen address
  MUXHAUL_TOKEN   Shared agent token
    "#)]
    Serve {
        /// Path to the YAML config file
        #[arg(short, long, env = "MUXHAUL_CONFIG", default_value = "muxhaul.yaml")]
        config: PathBuf,

        /// Tunnel listen address (overrides bind_addr)
        #[arg(long, env = "MUXHAUL_BIND")]
        bind: Option<String>,

        /// Shared agent token (overrides token)
        #[arg(long, env = "MUXHAUL_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Port mapping, repeatable (replaces ports)
        #[arg(long = "port")]
        ports: Vec<String>,
    },

    /// Validate a config file and print the resolved mappings
    Check {
        /// Path to the YAML config file
        #[arg(short, long, env = "MUXHAUL_CONFIG", default_value = "muxhaul.yaml")]
        config: PathBuf,
    },

    /// Print a sample config file
    Init,
}

/// Setup logging. `RUST_LOG` wins, then --verbose, then the config level.
fn setup_logging(verbose: bool, config_level: &str) {
    let default_level = if verbose { "debug" } else { config_level };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> Result<TunnelConfig> {
    TunnelConfig::load(path).with_context(|| format!("Failed to load config from {:?}", path))
}

async fn serve(
    verbose: bool,
    config_path: &Path,
    bind: Option<String>,
    token: Option<String>,
    ports: Vec<String>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(token) = token {
        config.token = token;
    }
    if !ports.is_empty() {
        config.ports = ports;
    }

    setup_logging(verbose, &config.log_level);

    let resolved = config.resolve().context("Invalid configuration")?;
    for mapping in &resolved.mappings {
        info!("port mapping {} -> {}", mapping.local_addr, mapping.remote_addr);
    }

    let shutdown = CancellationToken::new();
    let server = TcpMuxServer::with_shutdown(resolved, shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => error!("failed to listen for Ctrl-C: {}", e),
        }
        signal_token.cancel();
    });

    server.run().await.context("Tunnel server stopped")?;
    info!("tunnel server stopped");
    Ok(())
}

fn check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let resolved = config.resolve().context("Invalid configuration")?;

    println!("Config OK: {}", config_path.display());
    println!("  bind address: {}", resolved.bind_addr);
    println!("  mux_con: {}, channel_size: {}", resolved.mux_con, resolved.channel_size);
    for mapping in &resolved.mappings {
        println!("  {} -> {}", mapping.local_addr, mapping.remote_addr);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            token,
            ports,
        } => serve(cli.verbose, &config, bind, token, ports).await,
        Commands::Check { config } => check(&config),
        Commands::Init => {
            print!("{}", TunnelConfig::template());
            Ok(())
        }
    }
}
