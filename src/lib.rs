// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # OPC UA Discovery Server
//!
//! The discovery manager of an OPC UA server, usable as a library component
//! or through the standalone discovery server binary. It covers both sides
//! of server discovery:
//!
//! - **Discovery server**: a registry of peer servers that registered via
//!   `RegisterServer` / `RegisterServer2`, aged out by a periodic cleanup
//!   task when they time out or their semaphore file disappears, and an
//!   optional multicast DNS advertiser that announces this server and
//!   observes peers on the LAN.
//! - **Discovery client**: registering (and deregistering) this server
//!   against a remote discovery server over asynchronous secure channels,
//!   with transparent fallback from `RegisterServer` to `RegisterServer2`.
//!
//! The manager is a server component with an observable lifecycle; it
//! reports `Stopped` only after every outbound client and multicast
//! connection has drained, so the host knows when it may be destroyed.
//!
//! # Example
//!
//! ```no_run
//! use opcua_discovery_server::{DiscoveryConfig, DiscoveryManager};
//! use opcua_discovery_server::transport::tcp::TcpConnector;
//! use opcua_discovery_server::transport::ClientConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DiscoveryConfig::default();
//! let connector = Arc::new(TcpConnector::new(config.max_message_size));
//! let manager = DiscoveryManager::new(config, connector)?;
//!
//! manager.start().await?;
//! manager
//!     .register_discovery(ClientConfig::default(), "opc.tcp://lds:4840", "")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod protocol;
pub mod service;
pub mod transport;

pub use config::{ApplicationDescription, DiscoveryConfig, MdnsConfig};
pub use manager::{DiscoveryError, DiscoveryManager, LifecycleState};
pub use protocol::{RegisteredServer, StatusCode};
pub use service::DiscoveryEndpoint;
