// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level data model for the discovery services.
//!
//! Carries the standard `RegisterServer` / `RegisterServer2` request and
//! response bodies plus the enums and status codes they reference, and the
//! length-prefixed JSON framing used by the bundled TCP transport. The
//! framing is a custom encoding for this server, not interoperable with
//! OPC UA binary stacks; the bodies match the standard services field by
//! field so a different codec can be dropped underneath.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use serde::{Deserialize, Serialize};

/// OPC UA status code. The top two bits carry the severity; `0` is `Good`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_OUT_OF_MEMORY: StatusCode = StatusCode(0x8003_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVICE_UNSUPPORTED: StatusCode = StatusCode(0x800B_0000);
    pub const BAD_NOT_IMPLEMENTED: StatusCode = StatusCode(0x8040_0000);
    pub const BAD_SERVER_URI_INVALID: StatusCode = StatusCode(0x8074_0000);
    pub const BAD_SERVER_NAME_MISSING: StatusCode = StatusCode(0x8075_0000);
    pub const BAD_DISCOVERY_URL_MISSING: StatusCode = StatusCode(0x8076_0000);
    pub const BAD_SEMAPHORE_FILE_MISSING: StatusCode = StatusCode(0x8077_0000);
    pub const BAD_CONNECTION_REJECTED: StatusCode = StatusCode(0x80AC_0000);
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);
    pub const BAD_INVALID_STATE: StatusCode = StatusCode(0x80AF_0000);

    /// Good and Uncertain codes count as good here; only Bad severity fails.
    pub fn is_good(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        !self.is_good()
    }

    /// Symbolic name for the codes this crate uses.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::GOOD => "Good",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_OUT_OF_MEMORY => "BadOutOfMemory",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_SERVICE_UNSUPPORTED => "BadServiceUnsupported",
            Self::BAD_NOT_IMPLEMENTED => "BadNotImplemented",
            Self::BAD_SERVER_URI_INVALID => "BadServerUriInvalid",
            Self::BAD_SERVER_NAME_MISSING => "BadServerNameMissing",
            Self::BAD_DISCOVERY_URL_MISSING => "BadDiscoveryUrlMissing",
            Self::BAD_SEMAPHORE_FILE_MISSING => "BadSemaphoreFileMissing",
            Self::BAD_CONNECTION_REJECTED => "BadConnectionRejected",
            Self::BAD_CONNECTION_CLOSED => "BadConnectionClosed",
            Self::BAD_INVALID_STATE => "BadInvalidState",
            _ => return None,
        })
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "StatusCode(0x{:08X})", self.0),
        }
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::GOOD
    }
}

/// Application type from the application description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    #[default]
    Server,
    Client,
    ClientAndServer,
    DiscoveryServer,
}

/// Security mode negotiated on a secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSecurityMode {
    #[default]
    Invalid,
    None,
    Sign,
    SignAndEncrypt,
}

/// Coarse secure channel state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureChannelState {
    #[default]
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Session state. The discovery manager never opens a session; this exists
/// so transport state reports carry the full triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Closed,
    Created,
    Activated,
}

/// Localized text (locale id plus text).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalizedText {
    #[serde(default)]
    pub locale: String,
    pub text: String,
}

impl LocalizedText {
    pub fn new(locale: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            text: text.into(),
        }
    }
}

/// The `RegisteredServer` body shared by both register services.
///
/// An empty `semaphore_file_path` means no semaphore file is associated with
/// the registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisteredServer {
    pub server_uri: String,
    #[serde(default)]
    pub product_uri: String,
    #[serde(default)]
    pub server_names: Vec<LocalizedText>,
    #[serde(default)]
    pub server_type: ApplicationType,
    #[serde(default)]
    pub gateway_server_uri: String,
    #[serde(default)]
    pub discovery_urls: Vec<String>,
    #[serde(default)]
    pub semaphore_file_path: String,
    #[serde(default)]
    pub is_online: bool,
}

/// Common request header. Only the fields this server interprets are kept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestHeader {
    #[serde(default)]
    pub request_handle: u32,
    /// Hint in milliseconds for how long the caller is willing to wait.
    #[serde(default)]
    pub timeout_hint: u32,
}

/// Common response header.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(default)]
    pub request_handle: u32,
    pub service_result: StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServerRequest {
    pub request_header: RequestHeader,
    pub server: RegisteredServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServerResponse {
    pub response_header: ResponseHeader,
}

/// Discovery configuration extension carried by `RegisterServer2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryConfiguration {
    #[serde(rename = "mdns")]
    Mdns(MdnsDiscoveryConfiguration),
}

/// The multicast DNS announcement parameters of a registrant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MdnsDiscoveryConfiguration {
    pub mdns_server_name: String,
    #[serde(default)]
    pub server_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServer2Request {
    pub request_header: RequestHeader,
    pub server: RegisteredServer,
    #[serde(default)]
    pub discovery_configuration: Vec<DiscoveryConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServer2Response {
    pub response_header: ResponseHeader,
    /// One result per supplied discovery configuration, in order.
    #[serde(default)]
    pub configuration_results: Vec<StatusCode>,
}

/// Framed messages exchanged between the register client and the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryMessage {
    /// Client asks for a secure channel with the given security mode.
    #[serde(rename = "open_channel")]
    OpenChannel { security_mode: MessageSecurityMode },

    /// Server grants the channel and reports the effective security mode.
    #[serde(rename = "open_channel_ack")]
    OpenChannelAck { security_mode: MessageSecurityMode },

    /// Orderly channel teardown.
    #[serde(rename = "close_channel")]
    CloseChannel,

    #[serde(rename = "register_server")]
    RegisterServer(RegisterServerRequest),

    #[serde(rename = "register_server_response")]
    RegisterServerResponse(RegisterServerResponse),

    #[serde(rename = "register_server2")]
    RegisterServer2(RegisterServer2Request),

    #[serde(rename = "register_server2_response")]
    RegisterServer2Response(RegisterServer2Response),

    /// Transport-level error report.
    #[serde(rename = "error")]
    Error { code: u32, message: String },
}

impl DiscoveryMessage {
    /// Encode with the 4-byte big-endian length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = serde_json::to_vec(self).map_err(|e| ProtocolError::Json(e.to_string()))?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a message body (the length prefix already stripped).
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(buf).map_err(|e| ProtocolError::Json(e.to_string()))
    }
}

/// Protocol error types.
#[derive(Debug)]
pub enum ProtocolError {
    Json(String),
    InvalidLength(usize),
    InvalidUrl(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(s) => write!(f, "JSON error: {}", s),
            Self::InvalidLength(len) => write!(f, "Invalid message length: {}", len),
            Self::InvalidUrl(s) => write!(f, "Invalid endpoint URL: {}", s),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Default port for `opc.tcp` endpoint URLs without an explicit port.
pub const DEFAULT_OPC_TCP_PORT: u16 = 4840;

/// Split an `opc.tcp://host:port[/path]` endpoint URL into host and port.
pub fn parse_endpoint_url(url: &str) -> Result<(String, u16), ProtocolError> {
    let rest = url.strip_prefix("opc.tcp://").unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(ProtocolError::InvalidUrl(url.to_string()));
    }

    let invalid = || ProtocolError::InvalidUrl(url.to_string());

    // Bracketed IPv6 literal
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if rest.is_empty() => DEFAULT_OPC_TCP_PORT,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), DEFAULT_OPC_TCP_PORT)),
    }
}
