// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP-backed channel connector.
//!
//! Speaks the framed discovery messages against an endpoint. The channel
//! open handshake requests the configured security mode and reports the
//! granted mode on the `Open` state observation; no session is ever
//! created, which is all the register pool needs.

use super::{
    ChannelCommand, ChannelConnector, ChannelEvent, ChannelHandle, ChannelState, ClientConfig,
    TransportError, EVENT_CHANNEL_CAPACITY,
};
use crate::protocol::{
    parse_endpoint_url, DiscoveryMessage, MessageSecurityMode, SecureChannelState, SessionState,
    StatusCode,
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connector that opens framed TCP channels.
pub struct TcpConnector {
    max_message_size: usize,
}

impl TcpConnector {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl ChannelConnector for TcpConnector {
    fn open(&self, config: ClientConfig) -> Result<ChannelHandle, TransportError> {
        let (host, port) = parse_endpoint_url(&config.endpoint_url)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run_channel(
            config,
            host,
            port,
            self.max_message_size,
            cmd_rx,
            ev_tx,
        ));

        Ok(ChannelHandle {
            commands: cmd_tx,
            events: ev_rx,
        })
    }
}

fn state(
    channel: SecureChannelState,
    connect_status: StatusCode,
    security_mode: MessageSecurityMode,
) -> ChannelEvent {
    ChannelEvent::State(ChannelState {
        channel,
        session: SessionState::Closed,
        connect_status,
        security_mode,
    })
}

/// Drive one channel until it is closed.
async fn run_channel(
    config: ClientConfig,
    host: String,
    port: u16,
    max_message_size: usize,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let _ = events
        .send(state(
            SecureChannelState::Connecting,
            StatusCode::GOOD,
            MessageSecurityMode::Invalid,
        ))
        .await;

    let connect = TcpStream::connect((host.as_str(), port));
    let stream = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("Connect to {}:{} failed: {}", host, port, e);
            let _ = events
                .send(state(
                    SecureChannelState::Closed,
                    StatusCode::BAD_CONNECTION_REJECTED,
                    MessageSecurityMode::Invalid,
                ))
                .await;
            return;
        }
        Err(_) => {
            debug!("Connect to {}:{} timed out", host, port);
            let _ = events
                .send(state(
                    SecureChannelState::Closed,
                    StatusCode::BAD_TIMEOUT,
                    MessageSecurityMode::Invalid,
                ))
                .await;
            return;
        }
    };
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    // Channel open handshake; the server reports the effective mode
    let open = DiscoveryMessage::OpenChannel {
        security_mode: config.security_mode,
    };
    let handshake = async {
        write_frame(&mut writer, &open).await?;
        read_frame(&mut reader, max_message_size).await
    };
    let granted = match handshake.await {
        Ok(Some(DiscoveryMessage::OpenChannelAck { security_mode })) => security_mode,
        Ok(other) => {
            warn!("Channel open to {}:{} failed: {:?}", host, port, other);
            let _ = events
                .send(state(
                    SecureChannelState::Closed,
                    StatusCode::BAD_CONNECTION_CLOSED,
                    MessageSecurityMode::Invalid,
                ))
                .await;
            return;
        }
        Err(e) => {
            warn!("Channel open to {}:{} failed: {}", host, port, e);
            let _ = events
                .send(state(
                    SecureChannelState::Closed,
                    StatusCode::BAD_CONNECTION_CLOSED,
                    MessageSecurityMode::Invalid,
                ))
                .await;
            return;
        }
    };

    let _ = events
        .send(state(SecureChannelState::Open, StatusCode::GOOD, granted))
        .await;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let msg = match cmd {
                    Some(ChannelCommand::Register(request)) => {
                        DiscoveryMessage::RegisterServer(request)
                    }
                    Some(ChannelCommand::Register2(request)) => {
                        DiscoveryMessage::RegisterServer2(request)
                    }
                    // A dropped command side closes the channel as well
                    Some(ChannelCommand::Disconnect) | None => {
                        let _ = write_frame(&mut writer, &DiscoveryMessage::CloseChannel).await;
                        break;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    warn!("Write to {}:{} failed: {}", host, port, e);
                    break;
                }
            }
            msg = read_frame(&mut reader, max_message_size) => {
                match msg {
                    Ok(Some(DiscoveryMessage::RegisterServerResponse(response))) => {
                        if events.send(ChannelEvent::RegisterResponse(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(DiscoveryMessage::RegisterServer2Response(response))) => {
                        if events.send(ChannelEvent::Register2Response(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(DiscoveryMessage::Error { code, message })) => {
                        warn!("Error from {}:{}: {} - {}", host, port, code, message);
                    }
                    Ok(Some(other)) => {
                        debug!("Unexpected message from {}:{}: {:?}", host, port, other);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Read from {}:{} failed: {}", host, port, e);
                        break;
                    }
                }
            }
        }
    }

    let _ = events
        .send(state(
            SecureChannelState::Closed,
            StatusCode::BAD_CONNECTION_CLOSED,
            MessageSecurityMode::Invalid,
        ))
        .await;
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &DiscoveryMessage,
) -> io::Result<()> {
    let encoded = msg
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> io::Result<Option<DiscoveryMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_message_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length: {}", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    DiscoveryMessage::decode(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_invalid_url() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let connector = TcpConnector::new(1024 * 1024);
        let config = ClientConfig {
            endpoint_url: "opc.tcp://".into(),
            ..Default::default()
        };
        assert!(matches!(
            connector.open(config),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_closed_channel() {
        let connector = TcpConnector::new(1024 * 1024);
        // Port 1 on loopback refuses immediately
        let config = ClientConfig {
            endpoint_url: "opc.tcp://127.0.0.1:1".into(),
            ..Default::default()
        };
        let mut handle = connector.open(config).unwrap();

        let mut last = None;
        while let Some(event) = handle.events.recv().await {
            if let ChannelEvent::State(state) = event {
                last = Some(state);
            }
        }

        let last = last.expect("no state was reported");
        assert_eq!(last.channel, SecureChannelState::Closed);
        assert!(last.connect_status.is_bad());
    }
}
