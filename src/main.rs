//! MQTT Relay Gateway CLI
//!
//! Standalone relay binary for Sentinel.

use anyhow::{Context, Result};
use clap::Parser;
use sentinel_mqtt_relay::{AclHandler, GatewayConfig, Proxy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// MQTT Relay Gateway for Sentinel
#[derive(Parser, Debug)]
#[command(name = "sentinel-mqtt-relay")]
#[command(author = "Sentinel Contributors")]
#[command(version)]
#[command(about = "MQTT relay gateway with client certificate revocation checks", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "MQTT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Prefix of the environment variables overlaid on the configuration
    #[arg(long, default_value = "MQTT_RELAY_")]
    env_prefix: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting MQTT Relay Gateway");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        info!(path = %config_path.display(), "Loading configuration from file");
        GatewayConfig::from_file(config_path)?
    } else {
        GatewayConfig::default()
    };
    config.apply_env(&args.env_prefix)?;
    config.validate()?;

    let handler = AclHandler::from_config(&config)?;
    let proxy = Proxy::from_config(&config, Arc::new(handler))
        .context("failed to initialize MQTT relay")?;

    info!(
        address = %config.listener.address,
        target = %config.listener.target,
        security = %proxy.security(),
        methods = ?config.revocation.methods,
        "Relay initialized, starting listener"
    );

    proxy
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("MQTT Relay Gateway stopped");
    Ok(())
}
