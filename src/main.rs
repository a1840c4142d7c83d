// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OPC UA Discovery Server
//!
//! Standalone discovery server maintaining a registry of OPC UA servers:
//! - Accepts `RegisterServer` / `RegisterServer2` registrations
//! - Ages out registrations on timeout or semaphore file deletion
//! - Optionally announces itself and observes peers via multicast DNS
//!
//! # Usage
//!
//! ```bash
//! # Start the server on the default port (4840)
//! opcua-discovery-server
//!
//! # Custom port and config
//! opcua-discovery-server --port 4850 --config discovery.json
//!
//! # Disable time-based ageing, keep semaphore eviction
//! opcua-discovery-server --cleanup-timeout 0
//! ```

use clap::Parser;
use opcua_discovery_server::manager::LifecycleState;
use opcua_discovery_server::transport::mdns::UdpMdnsTransport;
use opcua_discovery_server::transport::tcp::TcpConnector;
use opcua_discovery_server::{DiscoveryConfig, DiscoveryEndpoint, DiscoveryManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// OPC UA Discovery Server - registration registry for server discovery
#[derive(Parser, Debug)]
#[command(name = "opcua-discovery-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "4840")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds until a silent registration is aged out (0 disables)
    #[arg(long, default_value = "3600")]
    cleanup_timeout: u64,

    /// Announce this server via multicast DNS
    #[arg(long, default_value = "false")]
    mdns: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
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
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config
    let mut config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        DiscoveryConfig::from_file(&config_path)?
    } else {
        DiscoveryConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            discovery_cleanup_timeout_secs: args.cleanup_timeout,
            mdns_enabled: args.mdns,
            ..Default::default()
        }
    };

    // Announce the endpoint itself when nothing else is configured
    if config.application.discovery_urls.is_empty() {
        config
            .application
            .discovery_urls
            .push(format!("opc.tcp://{}:{}", config.bind_address, config.port));
    }

    info!("+----------------------------------------------------+");
    info!(
        "|      OPC UA Discovery Server v{}               |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {}:{:<38} |", config.bind_address, config.port);
    info!(
        "|  Ageing:  {:40} |",
        if config.discovery_cleanup_timeout_secs == 0 {
            "disabled".to_string()
        } else {
            format!("{}s", config.discovery_cleanup_timeout_secs)
        }
    );
    info!(
        "|  mDNS:    {:40} |",
        if config.mdns_enabled { "enabled" } else { "disabled" }
    );
    info!("+----------------------------------------------------+");

    let connector = Arc::new(TcpConnector::new(config.max_message_size));
    let mut manager = DiscoveryManager::new(config.clone(), connector)?;
    if config.mdns_enabled {
        manager = manager.with_mdns_transport(Arc::new(UdpMdnsTransport::new(&config)));
    }
    manager.start().await?;

    let endpoint = DiscoveryEndpoint::new(Arc::new(config), manager.clone());

    // Handle shutdown signals
    let endpoint_handle = endpoint.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        endpoint_handle.shutdown();
    });

    // Serve registrations
    endpoint.run().await?;

    // Stop the component and wait for outstanding work to drain
    manager.stop().await;
    manager.wait_for(LifecycleState::Stopped).await;
    manager.free().await?;

    info!("Discovery server stopped");
    Ok(())
}
