// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP-backed multicast transport.
//!
//! Publishes announcements as JSON datagrams on a multicast group and
//! observes peer announcements on the same group. Like the TCP connector
//! this is a custom encoding, not interoperable with DNS-SD responders;
//! a different packet codec can be dropped in behind the `MdnsTransport`
//! contract. Datagrams from other protocols sharing the group are ignored.

use crate::config::DiscoveryConfig;
use crate::manager::multicast::{MdnsChannel, MdnsCommand, MdnsEvent, MdnsTransport};
use crate::transport::{TransportError, EVENT_CHANNEL_CAPACITY};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Multicast group announcements are exchanged on.
pub const MDNS_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Largest accepted datagram.
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Announcement datagrams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum MdnsWireMessage {
    /// A server is present on the network.
    #[serde(rename = "announce")]
    Announce {
        record: String,
        server_name: String,
        discovery_url: String,
        #[serde(default)]
        server_capabilities: Vec<String>,
    },

    /// A server withdraws its record before leaving.
    #[serde(rename = "goodbye")]
    Goodbye {
        server_name: String,
        discovery_url: String,
    },
}

/// Multicast transport over UDP sockets.
///
/// The send connection publishes this server's announcements; the receive
/// connection joins the group and reports peer announcements. Sockets are
/// opened per connection when the advertiser starts.
pub struct UdpMdnsTransport {
    server_name: String,
    discovery_url: String,
    server_capabilities: Vec<String>,
    port: u16,
}

impl UdpMdnsTransport {
    /// Capture the announcement parameters from the configuration.
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            server_name: config.mdns_server_name().to_string(),
            discovery_url: config
                .application
                .discovery_urls
                .first()
                .cloned()
                .unwrap_or_default(),
            server_capabilities: config.mdns.server_capabilities.clone(),
            port: config.mdns.port,
        }
    }

    fn group(&self) -> SocketAddr {
        SocketAddr::from((MDNS_MULTICAST_ADDR, self.port))
    }
}

impl MdnsTransport for UdpMdnsTransport {
    fn open_send(&self) -> Result<MdnsChannel, TransportError> {
        let socket = send_socket().map_err(|e| TransportError::Io(e.to_string()))?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run_send_connection(
            socket,
            self.group(),
            self.server_name.clone(),
            self.discovery_url.clone(),
            self.server_capabilities.clone(),
            cmd_rx,
            ev_tx,
        ));

        Ok(MdnsChannel {
            commands: cmd_tx,
            events: ev_rx,
        })
    }

    fn open_recv(&self) -> Result<Vec<MdnsChannel>, TransportError> {
        let socket = multicast_socket(self.port).map_err(|e| TransportError::Io(e.to_string()))?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run_recv_connection(
            socket,
            self.server_name.clone(),
            cmd_rx,
            ev_tx,
        ));

        Ok(vec![MdnsChannel {
            commands: cmd_tx,
            events: ev_rx,
        }])
    }
}

/// Group-joined socket for observing announcements.
fn multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&MDNS_MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(socket.into())
}

/// Ephemeral socket for publishing announcements.
fn send_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    UdpSocket::from_std(socket.into())
}

/// Publish announcements until the connection is closed. A goodbye datagram
/// withdraws the record on the way out; dropping the event sender confirms
/// the teardown to the advertiser.
async fn run_send_connection(
    socket: UdpSocket,
    group: SocketAddr,
    server_name: String,
    discovery_url: String,
    server_capabilities: Vec<String>,
    mut commands: mpsc::UnboundedReceiver<MdnsCommand>,
    _events: mpsc::Sender<MdnsEvent>,
) {
    loop {
        match commands.recv().await {
            Some(MdnsCommand::Announce(record)) => {
                let msg = MdnsWireMessage::Announce {
                    record,
                    server_name: server_name.clone(),
                    discovery_url: discovery_url.clone(),
                    server_capabilities: server_capabilities.clone(),
                };
                send_datagram(&socket, group, &msg).await;
            }
            Some(MdnsCommand::Close) | None => {
                let msg = MdnsWireMessage::Goodbye {
                    server_name,
                    discovery_url,
                };
                send_datagram(&socket, group, &msg).await;
                break;
            }
        }
    }
}

/// Observe announcements until the connection is closed. Own announcements
/// loop back on the group and are filtered by name.
async fn run_recv_connection(
    socket: UdpSocket,
    self_name: String,
    mut commands: mpsc::UnboundedReceiver<MdnsCommand>,
    events: mpsc::Sender<MdnsEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let len = match result {
                    Ok((len, _peer)) => len,
                    Err(e) => {
                        debug!("mDNS receive failed: {}", e);
                        continue;
                    }
                };
                let Ok(msg) = serde_json::from_slice::<MdnsWireMessage>(&buf[..len]) else {
                    continue;
                };
                let event = match msg {
                    MdnsWireMessage::Announce {
                        server_name,
                        discovery_url,
                        server_capabilities,
                        ..
                    } => {
                        if server_name == self_name {
                            continue;
                        }
                        MdnsEvent::ServerFound {
                            server_name,
                            discovery_url,
                            server_capabilities,
                        }
                    }
                    MdnsWireMessage::Goodbye {
                        server_name,
                        discovery_url,
                    } => {
                        if server_name == self_name {
                            continue;
                        }
                        MdnsEvent::ServerGone {
                            server_name,
                            discovery_url,
                        }
                    }
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(MdnsCommand::Close) | None => break,
                    // The receive side does not publish
                    Some(MdnsCommand::Announce(_)) => {}
                }
            }
        }
    }
}

async fn send_datagram(socket: &UdpSocket, group: SocketAddr, msg: &MdnsWireMessage) {
    match serde_json::to_vec(msg) {
        Ok(payload) => {
            if let Err(e) = socket.send_to(&payload, group).await {
                debug!("mDNS send failed: {}", e);
            }
        }
        Err(e) => warn!("mDNS message encode failed: {}", e),
    }
}
