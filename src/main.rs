// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DNY Device Gateway
//!
//! Standalone TCP gateway terminating DNY protocol device connections:
//! pre-registration handshake, session/group bookkeeping, heartbeat
//! supervision, and status-update coalescing ahead of whatever business
//! surface consumes it.
//!
//! # Usage
//!
//! ```bash
//! # Start the gateway with defaults (0.0.0.0:7700)
//! dny-gateway
//!
//! # Custom port and config file
//! dny-gateway --port 7710 --config gateway.yaml
//! ```

use clap::Parser;
use dny_gateway::config::GatewayConfig;
use dny_gateway::GatewayServer;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// DNY Device Gateway - TCP termination for DNY protocol devices
#[derive(Parser, Debug)]
#[command(name = "dny-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Configuration file (YAML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = if let Some(config_path) = &args.config {
        info!(path = ?config_path, "loading config");
        GatewayConfig::from_file(config_path)?
    } else {
        GatewayConfig::default()
    };

    if let Some(port) = args.port {
        config.tcp.port = port;
    }
    if let Some(bind) = &args.bind {
        config.tcp.host = bind.parse()?;
    }

    let addr = std::net::SocketAddr::new(config.tcp.host, config.tcp.port);

    info!("+----------------------------------------------------+");
    info!(
        "|          DNY Device Gateway v{}               |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:        {:38} |", addr);
    info!("|  Max conn:    {:38} |", config.tcp.max_conn);
    info!(
        "|  Heartbeat:   {:38} |",
        format!("{}s", config.device_connection.heartbeat_timeout_seconds)
    );
    info!("+----------------------------------------------------+");

    let gateway = GatewayServer::new(config)?;

    let gateway_handle = gateway.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, stopping gateway...");
        gateway_handle.shutdown();
    });

    gateway.run().await?;

    info!("gateway stopped");
    Ok(())
}
