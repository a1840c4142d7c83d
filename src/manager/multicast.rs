// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast DNS advertisement and observation.
//!
//! The advertiser owns one send connection and zero or more receive
//! connections, all opened through an [`MdnsTransport`]. Packet parsing and
//! socket handling live behind that contract; this module keeps the
//! server-on-network table and drives the periodic self announcement from
//! the cleanup tick.

use crate::config::MdnsConfig;
use crate::transport::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Bucket count of the server-on-network name index. Must stay a power of
/// two, the hash is masked with `SERVER_ON_NETWORK_BUCKETS - 1`.
pub const SERVER_ON_NETWORK_BUCKETS: usize = 64;

/// Commands accepted by an mDNS connection.
#[derive(Debug)]
pub enum MdnsCommand {
    /// Publish an announcement record.
    Announce(String),
    /// Close the connection. The transport confirms by ending the event
    /// stream.
    Close,
}

/// Observations reported by an mDNS receive connection.
#[derive(Debug, Clone)]
pub enum MdnsEvent {
    ServerFound {
        server_name: String,
        discovery_url: String,
        server_capabilities: Vec<String>,
    },
    ServerGone {
        server_name: String,
        discovery_url: String,
    },
}

/// One mDNS connection as handed out by the transport.
pub struct MdnsChannel {
    pub commands: mpsc::UnboundedSender<MdnsCommand>,
    pub events: mpsc::Receiver<MdnsEvent>,
}

/// Opens multicast DNS connections. The send connection publishes this
/// server's record; receive connections observe peer announcements.
pub trait MdnsTransport: Send + Sync {
    fn open_send(&self) -> Result<MdnsChannel, TransportError>;
    fn open_recv(&self) -> Result<Vec<MdnsChannel>, TransportError>;
}

/// An advertisement observed on the LAN.
#[derive(Debug, Clone)]
pub struct ServerOnNetwork {
    pub record_id: u32,
    pub server_name: String,
    pub discovery_url: String,
    pub server_capabilities: Vec<String>,
}

/// Server-on-network records in observation order, with a name index.
#[derive(Debug)]
pub struct ServerOnNetworkTable {
    records: Vec<ServerOnNetwork>,
    /// Record ids per name-hash bucket.
    buckets: Vec<Vec<u32>>,
    next_record_id: u32,
    last_id_reset: Instant,
}

impl Default for ServerOnNetworkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerOnNetworkTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            buckets: vec![Vec::new(); SERVER_ON_NETWORK_BUCKETS],
            next_record_id: 0,
            last_id_reset: Instant::now(),
        }
    }

    fn bucket_of(server_name: &str) -> usize {
        fnv1a(server_name.as_bytes()) as usize & (SERVER_ON_NETWORK_BUCKETS - 1)
    }

    /// Record an observed announcement. Returns the record id when the
    /// record is new; a record with the same name and URL is already known.
    pub fn observe(
        &mut self,
        server_name: &str,
        discovery_url: &str,
        server_capabilities: Vec<String>,
    ) -> Option<u32> {
        if self.find(server_name, discovery_url).is_some() {
            return None;
        }

        let record_id = self.next_record_id;
        self.next_record_id = self.next_record_id.wrapping_add(1);

        self.records.push(ServerOnNetwork {
            record_id,
            server_name: server_name.to_string(),
            discovery_url: discovery_url.to_string(),
            server_capabilities,
        });
        self.buckets[Self::bucket_of(server_name)].push(record_id);
        Some(record_id)
    }

    /// Drop a record when its announcement is withdrawn.
    pub fn remove(&mut self, server_name: &str, discovery_url: &str) -> bool {
        let Some(index) = self
            .records
            .iter()
            .position(|r| r.server_name == server_name && r.discovery_url == discovery_url)
        else {
            return false;
        };

        let record = self.records.remove(index);
        self.buckets[Self::bucket_of(server_name)].retain(|id| *id != record.record_id);
        true
    }

    fn find(&self, server_name: &str, discovery_url: &str) -> Option<&ServerOnNetwork> {
        self.buckets[Self::bucket_of(server_name)]
            .iter()
            .filter_map(|id| self.records.iter().find(|r| r.record_id == *id))
            .find(|r| r.server_name == server_name && r.discovery_url == discovery_url)
    }

    /// All records announced under the given name.
    pub fn find_by_name(&self, server_name: &str) -> Vec<&ServerOnNetwork> {
        self.buckets[Self::bucket_of(server_name)]
            .iter()
            .filter_map(|id| self.records.iter().find(|r| r.record_id == *id))
            .filter(|r| r.server_name == server_name)
            .collect()
    }

    /// Records in observation order.
    pub fn records(&self) -> &[ServerOnNetwork] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reset the record id allocator once the configured epoch has passed
    /// and no live record could collide with a re-issued id.
    pub fn maybe_reset_record_ids(&mut self, epoch: Duration) -> bool {
        if self.next_record_id != 0
            && self.records.is_empty()
            && self.last_id_reset.elapsed() >= epoch
        {
            self.next_record_id = 0;
            self.last_id_reset = Instant::now();
            return true;
        }
        false
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Handle to one open mDNS connection.
pub(crate) struct ConnectionHandle {
    pub(crate) commands: mpsc::UnboundedSender<MdnsCommand>,
    /// Cleared by the connection task once the event stream has ended.
    pub(crate) open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<MdnsCommand>) -> Self {
        Self {
            commands,
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// Multicast advertiser state owned by the discovery manager.
pub(crate) struct MulticastAdvertiser {
    send: Option<ConnectionHandle>,
    recv: Vec<ConnectionHandle>,
    pub(crate) records: ServerOnNetworkTable,
    /// Cached record string announced for this server.
    self_fqdn_record: String,
    last_announce: Option<Instant>,
}

impl MulticastAdvertiser {
    pub(crate) fn new(server_name: &str) -> Self {
        Self {
            send: None,
            recv: Vec::new(),
            records: ServerOnNetworkTable::new(),
            self_fqdn_record: format!("{}._opcua-tcp._tcp.local.", server_name),
            last_announce: None,
        }
    }

    pub(crate) fn attach_send(&mut self, handle: ConnectionHandle) {
        self.send = Some(handle);
    }

    pub(crate) fn attach_recv(&mut self, handle: ConnectionHandle) {
        self.recv.push(handle);
    }

    /// Number of connections that have not finished closing. Prunes handles
    /// whose task has confirmed teardown.
    pub(crate) fn live_connections(&mut self) -> usize {
        self.recv.retain(|h| h.open.load(Ordering::SeqCst));
        if self
            .send
            .as_ref()
            .is_some_and(|h| !h.open.load(Ordering::SeqCst))
        {
            self.send = None;
        }
        self.recv.len() + usize::from(self.send.is_some())
    }

    /// Ask every connection to close. Teardown completes asynchronously.
    pub(crate) fn stop(&mut self) {
        if let Some(send) = &self.send {
            let _ = send.commands.send(MdnsCommand::Close);
        }
        for conn in &self.recv {
            let _ = conn.commands.send(MdnsCommand::Close);
        }
    }

    /// Flush announcements that are due. Driven from the cleanup tick.
    pub(crate) fn send_scheduled(&mut self, config: &MdnsConfig) {
        let due = self
            .last_announce
            .map_or(true, |t| t.elapsed() >= config.announce_interval());
        if due {
            if let Some(send) = &self.send {
                if send
                    .commands
                    .send(MdnsCommand::Announce(self.self_fqdn_record.clone()))
                    .is_ok()
                {
                    debug!("Announced '{}' via mDNS", self.self_fqdn_record);
                }
            }
            self.last_announce = Some(Instant::now());
        }

        if self
            .records
            .maybe_reset_record_ids(config.record_id_reset_interval())
        {
            debug!("Server-on-network record id allocator reset");
        }
    }

    #[cfg(test)]
    pub(crate) fn self_record(&self) -> &str {
        &self.self_fqdn_record
    }
}
