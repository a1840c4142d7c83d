// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration table for peer servers.

use crate::protocol::{RegisteredServer, StatusCode};
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Probes for the existence of a registration semaphore file.
///
/// An `Err` means the probe itself failed and says nothing about the file;
/// the sweep never evicts on a probe error.
pub trait FileProbe: Send + Sync {
    fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Filesystem-backed probe.
pub struct FsProbe;

impl FileProbe for FsProbe {
    fn exists(&self, path: &str) -> io::Result<bool> {
        match std::fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A registered peer server with its bookkeeping.
#[derive(Debug, Clone)]
pub struct RegisteredServerEntry {
    pub server: RegisteredServer,

    /// Last time this registration was received or refreshed.
    pub last_seen: Instant,
}

/// Table of registered peer servers, keyed by server URI.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: HashMap<String, RegisteredServerEntry>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `RegisterServer` / `RegisterServer2` body.
    ///
    /// Validates the request, then inserts or refreshes the entry. A request
    /// with `is_online = false` removes the registration immediately.
    /// Returns the service result for the response.
    pub fn apply_registration(
        &mut self,
        server: RegisteredServer,
        probe: &dyn FileProbe,
    ) -> StatusCode {
        if server.server_uri.is_empty() {
            return StatusCode::BAD_SERVER_URI_INVALID;
        }
        if server.server_names.iter().all(|n| n.text.is_empty()) {
            return StatusCode::BAD_SERVER_NAME_MISSING;
        }
        if server.discovery_urls.is_empty() {
            return StatusCode::BAD_DISCOVERY_URL_MISSING;
        }
        if !server.semaphore_file_path.is_empty() {
            match probe.exists(&server.semaphore_file_path) {
                Ok(false) => return StatusCode::BAD_SEMAPHORE_FILE_MISSING,
                Ok(true) => {}
                // A failed probe is not evidence of a missing file.
                Err(e) => warn!(
                    "Cannot check the semaphore file '{}': {}",
                    server.semaphore_file_path, e
                ),
            }
        }

        if !server.is_online {
            if self.servers.remove(&server.server_uri).is_some() {
                info!(
                    "Registration of server with URI {} is removed (went offline)",
                    server.server_uri
                );
            }
            return StatusCode::GOOD;
        }

        let uri = server.server_uri.clone();
        let entry = RegisteredServerEntry {
            server,
            last_seen: Instant::now(),
        };
        if self.servers.insert(uri.clone(), entry).is_some() {
            info!("Re-registering known server: {}", uri);
        } else {
            info!("Registering new server: {}", uri);
        }
        StatusCode::GOOD
    }

    /// Age out registrations.
    ///
    /// An entry is removed when its semaphore file is confirmed missing, or
    /// when time-based eviction is enabled and the entry has not been seen
    /// within `cleanup_timeout`. Returns the URIs of removed entries.
    pub fn sweep(
        &mut self,
        cleanup_timeout: Option<Duration>,
        probe: &dyn FileProbe,
    ) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();

        self.servers.retain(|uri, entry| {
            let mut semaphore_deleted = false;
            if !entry.server.semaphore_file_path.is_empty() {
                match probe.exists(&entry.server.semaphore_file_path) {
                    Ok(exists) => semaphore_deleted = !exists,
                    Err(e) => {
                        warn!("Cannot check the registration semaphore of {}: {}", uri, e);
                    }
                }
            }

            let timed_out = cleanup_timeout
                .is_some_and(|timeout| now.duration_since(entry.last_seen) > timeout);

            if semaphore_deleted {
                info!(
                    "Registration of server with URI {} is removed because \
                     the semaphore file '{}' was deleted",
                    uri, entry.server.semaphore_file_path
                );
            } else if timed_out {
                info!(
                    "Registration of server with URI {} has timed out and is removed",
                    uri
                );
            } else {
                return true;
            }

            removed.push(uri.clone());
            false
        });

        removed
    }

    pub fn get(&self, server_uri: &str) -> Option<&RegisteredServerEntry> {
        self.servers.get(server_uri)
    }

    pub fn servers(&self) -> impl Iterator<Item = &RegisteredServerEntry> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Drop all registrations.
    pub fn clear(&mut self) {
        self.servers.clear();
    }

    /// Backdate an entry, as if it had registered `by` ago.
    #[cfg(test)]
    pub(crate) fn rewind_last_seen(&mut self, server_uri: &str, by: Duration) {
        let entry = self.servers.get_mut(server_uri).unwrap();
        entry.last_seen = Instant::now() - by;
    }
}
