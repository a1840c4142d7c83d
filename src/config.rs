// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery Manager configuration.

use crate::protocol::{ApplicationType, LocalizedText};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Description of the application hosting the discovery manager.
///
/// The fields mirror the application description the register services put
/// on the wire: the registrant announces itself with `application_uri` as the
/// unique server URI and `discovery_urls` as the endpoints peers may use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDescription {
    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    #[serde(default = "default_product_uri")]
    pub product_uri: String,

    #[serde(default = "default_application_name")]
    pub application_name: LocalizedText,

    #[serde(default)]
    pub application_type: ApplicationType,

    /// URI of the gateway server, if this server sits behind one.
    #[serde(default)]
    pub gateway_server_uri: String,

    /// Endpoint URLs announced on registration.
    #[serde(default)]
    pub discovery_urls: Vec<String>,
}

fn default_application_uri() -> String {
    "urn:opcua:discovery-server".into()
}

fn default_product_uri() -> String {
    "urn:opcua:discovery-server".into()
}

fn default_application_name() -> LocalizedText {
    LocalizedText::new("en", "OPC UA Discovery Server")
}

impl Default for ApplicationDescription {
    fn default() -> Self {
        Self {
            application_uri: default_application_uri(),
            product_uri: default_product_uri(),
            application_name: default_application_name(),
            application_type: ApplicationType::DiscoveryServer,
            gateway_server_uri: String::new(),
            discovery_urls: Vec::new(),
        }
    }
}

/// Multicast DNS settings, used when `mdns_enabled` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdnsConfig {
    /// Name announced on the LAN. Falls back to the application name when
    /// empty.
    #[serde(default)]
    pub server_name: String,

    /// Capability strings carried in announcements (e.g. "LDS").
    #[serde(default = "default_server_capabilities")]
    pub server_capabilities: Vec<String>,

    /// UDP port of the multicast group.
    #[serde(default = "default_mdns_port")]
    pub port: u16,

    /// Seconds between periodic self announcements.
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Seconds after which the server-on-network record id allocator may be
    /// reset (only once the table has emptied).
    #[serde(default = "default_record_id_reset_interval")]
    pub record_id_reset_interval_secs: u64,
}

fn default_server_capabilities() -> Vec<String> {
    vec!["LDS".into()]
}

fn default_mdns_port() -> u16 {
    5353
}

fn default_announce_interval() -> u64 {
    30
}

fn default_record_id_reset_interval() -> u64 {
    86_400
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            server_capabilities: default_server_capabilities(),
            port: default_mdns_port(),
            announce_interval_secs: default_announce_interval(),
            record_id_reset_interval_secs: default_record_id_reset_interval(),
        }
    }
}

impl MdnsConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn record_id_reset_interval(&self) -> Duration {
        Duration::from_secs(self.record_id_reset_interval_secs)
    }
}

/// Discovery Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Address the inbound endpoint binds to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port of the inbound endpoint (default: 4840)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds after which a registration without activity is aged out.
    /// 0 disables time-based eviction.
    #[serde(default = "default_cleanup_timeout")]
    pub discovery_cleanup_timeout_secs: u64,

    /// Announce and observe peers over multicast DNS.
    #[serde(default)]
    pub mdns_enabled: bool,

    /// Require sign-and-encrypt on outbound register channels.
    #[serde(default = "default_true")]
    pub encryption: bool,

    /// Maximum framed message size (bytes).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub application: ApplicationDescription,

    #[serde(default)]
    pub mdns: MdnsConfig,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    4840
}

fn default_cleanup_timeout() -> u64 {
    // Registrations without a semaphore file age out after 60 minutes.
    3600
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            discovery_cleanup_timeout_secs: default_cleanup_timeout(),
            mdns_enabled: false,
            encryption: true,
            max_message_size: default_max_message_size(),
            application: ApplicationDescription::default(),
            mdns: MdnsConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Age-out horizon for registrations, `None` when eviction is disabled.
    pub fn cleanup_timeout(&self) -> Option<Duration> {
        if self.discovery_cleanup_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.discovery_cleanup_timeout_secs))
        }
    }

    /// The name used in multicast announcements.
    pub fn mdns_server_name(&self) -> &str {
        if self.mdns.server_name.is_empty() {
            &self.application.application_name.text
        } else {
            &self.mdns.server_name
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_size cannot be 0".into(),
            ));
        }
        if self.application.application_uri.is_empty() {
            return Err(ConfigError::InvalidValue(
                "application_uri cannot be empty".into(),
            ));
        }
        if self.application.application_name.text.is_empty() {
            return Err(ConfigError::InvalidValue(
                "application_name cannot be empty".into(),
            ));
        }
        if self.mdns_enabled && self.mdns_server_name().is_empty() {
            return Err(ConfigError::InvalidValue(
                "mdns server_name required when mDNS enabled".into(),
            ));
        }
        if self.mdns_enabled && self.mdns.port == 0 {
            return Err(ConfigError::InvalidValue(
                "mdns port cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
