//! sshbox SSH Gateway
//!
//! An SSH server that authenticates users against an authorized_keys file and
//! runs every session inside a Docker container, either one container per
//! connection or one per session channel.

mod auth;
mod config;
mod docker;
mod error;
mod logging;
mod metrics;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthorizedKeys;
use crate::config::GatewayConfig;
use crate::metrics::BackendMetrics;
use crate::ssh::ServerState;

/// sshbox SSH Gateway - runs SSH sessions in containers
#[derive(Parser, Debug)]
#[command(name = "sshbox-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/sshbox/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.validate().context("Configuration rejected")?;
    if cli.check_config {
        println!("{}: ok", cli.config.display());
        return Ok(());
    }

    config.ensure_dirs()?;

    info!("Starting sshbox-gateway");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Docker host: {}", config.docker.connection.host);
    info!("  Execution mode: {}", config.docker.execution.mode);
    info!("  Image: {}", config.docker.execution.image);

    let authorized_keys = AuthorizedKeys::load(&config.auth.authorized_keys)?;
    let server = Arc::new(ServerState::new(
        Arc::new(config),
        BackendMetrics::default(),
        authorized_keys,
    ));

    ssh::run_server(server).await?;

    info!("sshbox-gateway stopped");
    Ok(())
}
