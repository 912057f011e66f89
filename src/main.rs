//! Zentinel Gateway command line entry point.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use zentinel_gateway::{Gateway, GatewayConfig};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-gateway")]
#[command(about = "Authenticating HTTP gateway for Zentinel")]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'f', long, default_value = "gateway.json", env = "GATEWAY_CONFIG")]
    config: PathBuf,

    /// Listen address, overrides the configuration file
    #[arg(long, env = "GATEWAY_LISTEN")]
    listen: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "json", env = "GATEWAY_LOG_FORMAT")]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long, env = "GATEWAY_VERBOSE")]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

fn init_tracing(args: &Args) {
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = format!(
        "{}={},hyper=warn,reqwest=warn",
        env!("CARGO_CRATE_NAME"),
        log_level
    );

    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!(config = ?args.config, "Starting Zentinel Gateway");

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }

    let gateway = Gateway::from_config(&config)?;

    info!(
        listen = %config.listen,
        backend = %config.backend.origin,
        access_control = config.access_control.len(),
        endpoints = config.endpoints.len(),
        secure_cookies = ?config.secure_cookies,
        "Configuration loaded"
    );

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    Arc::new(gateway).run(listener, shutdown_signal()).await
}
