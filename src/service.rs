// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound service endpoint for the register services.
//!
//! Accepts framed `RegisterServer` / `RegisterServer2` requests over TCP and
//! applies them to the discovery manager's registration table. The endpoint
//! is hosted by the outer server and is independent of the manager's
//! lifecycle; registrations are only accepted while the manager exists.

use crate::config::DiscoveryConfig;
use crate::manager::DiscoveryManager;
use crate::protocol::{
    DiscoveryMessage, MessageSecurityMode, ProtocolError, RegisterServer2Response,
    RegisterServerResponse, ResponseHeader, StatusCode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Discovery service endpoint.
#[derive(Clone)]
pub struct DiscoveryEndpoint {
    config: Arc<DiscoveryConfig>,
    manager: DiscoveryManager,
    shutdown: Arc<tokio::sync::Notify>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl DiscoveryEndpoint {
    pub fn new(config: Arc<DiscoveryConfig>, manager: DiscoveryManager) -> Self {
        Self {
            config,
            manager,
            shutdown: Arc::new(tokio::sync::Notify::new()),
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Bind to the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServiceError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServiceError::Bind(e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServiceError> {
        use std::sync::atomic::Ordering;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }

        if let Ok(addr) = listener.local_addr() {
            info!("Discovery endpoint listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);

                            let manager = self.manager.clone();
                            let config = self.config.clone();
                            let shutdown = self.shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, peer_addr, manager, config, shutdown)
                                        .await
                                {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Discovery endpoint shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the endpoint and all connection handlers to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Handle one client connection.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: DiscoveryManager,
    config: Arc<DiscoveryConfig>,
    shutdown: Arc<tokio::sync::Notify>,
) -> Result<(), ServiceError> {
    let mut conn = ServiceConnection::new(stream, peer_addr, config.max_message_size);

    loop {
        tokio::select! {
            result = conn.read_message() => {
                match result {
                    Ok(Some(DiscoveryMessage::CloseChannel)) => {
                        debug!("Channel closed by {}", peer_addr);
                        break;
                    }
                    Ok(Some(msg)) => {
                        process_message(&mut conn, msg, &manager, &config).await?;
                    }
                    Ok(None) => {
                        debug!("Connection closed: {}", peer_addr);
                        break;
                    }
                    Err(e) => {
                        warn!("Read error from {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
            _ = shutdown.notified() => {
                debug!("Connection handler shutting down: {}", peer_addr);
                break;
            }
        }
    }

    Ok(())
}

/// Process a received message.
async fn process_message(
    conn: &mut ServiceConnection,
    msg: DiscoveryMessage,
    manager: &DiscoveryManager,
    config: &DiscoveryConfig,
) -> Result<(), ServiceError> {
    match msg {
        DiscoveryMessage::OpenChannel { security_mode } => {
            // Grant the server's required mode; unencrypted only when
            // encryption is disabled.
            let granted = if config.encryption {
                MessageSecurityMode::SignAndEncrypt
            } else {
                security_mode
            };
            conn.send_message(&DiscoveryMessage::OpenChannelAck {
                security_mode: granted,
            })
            .await?;
        }

        DiscoveryMessage::RegisterServer(request) => {
            let service_result = manager.apply_registration(request.server).await;
            conn.send_message(&DiscoveryMessage::RegisterServerResponse(
                RegisterServerResponse {
                    response_header: ResponseHeader {
                        request_handle: request.request_header.request_handle,
                        service_result,
                    },
                },
            ))
            .await?;
        }

        DiscoveryMessage::RegisterServer2(request) => {
            let service_result = manager.apply_registration(request.server).await;
            // Every supplied discovery configuration is accepted as-is
            let configuration_results = request
                .discovery_configuration
                .iter()
                .map(|_| StatusCode::GOOD)
                .collect();
            conn.send_message(&DiscoveryMessage::RegisterServer2Response(
                RegisterServer2Response {
                    response_header: ResponseHeader {
                        request_handle: request.request_header.request_handle,
                        service_result,
                    },
                    configuration_results,
                },
            ))
            .await?;
        }

        DiscoveryMessage::Error { code, message } => {
            warn!("Received error from client: {} - {}", code, message);
        }

        other => {
            debug!("Unexpected message: {:?}", other);
            conn.send_message(&DiscoveryMessage::Error {
                code: StatusCode::BAD_SERVICE_UNSUPPORTED.0,
                message: "Unexpected message".into(),
            })
            .await?;
        }
    }

    Ok(())
}

/// A connected client.
struct ServiceConnection {
    stream: TcpStream,
    #[allow(dead_code)]
    peer_addr: SocketAddr,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl ServiceConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            stream,
            peer_addr,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read a message from the client.
    ///
    /// Returns `Ok(None)` if the connection is closed gracefully.
    async fn read_message(&mut self) -> Result<Option<DiscoveryMessage>, ServiceError> {
        // Read length prefix (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None); // Connection closed
            }
            Err(e) => return Err(ServiceError::Io(e.to_string())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 || len > self.max_message_size {
            return Err(ServiceError::Protocol(format!(
                "Invalid message length: {}",
                len
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);

        self.stream
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))?;

        let msg = DiscoveryMessage::decode(&self.read_buffer)?;
        Ok(Some(msg))
    }

    /// Send a message to the client.
    async fn send_message(&mut self, msg: &DiscoveryMessage) -> Result<(), ServiceError> {
        let encoded = msg.encode()?;

        if encoded.len() > self.max_message_size + 4 {
            return Err(ServiceError::Protocol(format!(
                "Response too large: {}",
                encoded.len()
            )));
        }

        self.stream
            .write_all(&encoded)
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))?;

        Ok(())
    }
}

/// Service endpoint error types.
#[derive(Debug)]
pub enum ServiceError {
    Bind(String),
    AlreadyRunning,
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::AlreadyRunning => write!(f, "Endpoint already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "Protocol error: {}", s),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ProtocolError> for ServiceError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}
