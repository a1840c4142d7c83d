// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery Manager core implementation.
//!
//! The manager is a server component with an observable lifecycle. `start`
//! activates a periodic cleanup task (and the multicast advertiser when
//! enabled); `stop` cancels outstanding outbound registrations and tears the
//! advertiser down. The component reports `Stopped` only once every outbound
//! client and every multicast connection has finished draining, so `free` is
//! safe exactly when the state says so.

use crate::config::DiscoveryConfig;
use crate::protocol::{MessageSecurityMode, RegisteredServer, StatusCode};
use crate::transport::{ChannelCommand, ChannelConnector, ClientConfig, TransportError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

pub mod multicast;
pub mod register;
pub mod registry;

use multicast::{ConnectionHandle, MdnsEvent, MdnsTransport, MulticastAdvertiser};
use register::{RegisterSlot, MAX_REGISTER_REQUESTS};
use registry::{FileProbe, FsProbe, ServerRegistry};

/// Interval of the registration cleanup task.
const CLEANUP_INTERVAL: Duration = Duration::from_millis(1000);

/// Component name under which the manager registers with the host server.
pub const COMPONENT_NAME: &str = "discovery";

/// Lifecycle of a server component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Hook invoked on every lifecycle transition.
pub type StateHook = Box<dyn Fn(LifecycleState) + Send + Sync>;

/// Discovery Manager - registration registry and outbound register client.
#[derive(Clone)]
pub struct DiscoveryManager {
    inner: Arc<Mutex<Inner>>,
    config: Arc<DiscoveryConfig>,
    connector: Arc<dyn ChannelConnector>,
    mdns_transport: Option<Arc<dyn MdnsTransport>>,
    probe: Arc<dyn FileProbe>,
    /// Pulsed on every state transition, for `wait_for`.
    state_changed: Arc<Notify>,
    notify_state: Arc<std::sync::Mutex<Option<StateHook>>>,
}

struct Inner {
    state: LifecycleState,
    registry: ServerRegistry,
    slots: [Option<RegisterSlot>; MAX_REGISTER_REQUESTS],
    multicast: Option<MulticastAdvertiser>,
    ticker_shutdown: Option<Arc<Notify>>,
}

impl DiscoveryManager {
    /// Create a new discovery manager.
    pub fn new(
        config: DiscoveryConfig,
        connector: Arc<dyn ChannelConnector>,
    ) -> Result<Self, DiscoveryError> {
        config
            .validate()
            .map_err(|e| DiscoveryError::Config(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                state: LifecycleState::Stopped,
                registry: ServerRegistry::new(),
                slots: std::array::from_fn(|_| None),
                multicast: None,
                ticker_shutdown: None,
            })),
            config: Arc::new(config),
            connector,
            mdns_transport: None,
            probe: Arc::new(FsProbe),
            state_changed: Arc::new(Notify::new()),
            notify_state: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// Use the given multicast transport when mDNS is enabled.
    pub fn with_mdns_transport(mut self, transport: Arc<dyn MdnsTransport>) -> Self {
        self.mdns_transport = Some(transport);
        self
    }

    /// Replace the semaphore file probe.
    pub fn with_file_probe(mut self, probe: Arc<dyn FileProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Install the state-change hook. Called once per strict transition,
    /// never twice in a row with the same state.
    pub fn set_state_hook(&self, hook: impl Fn(LifecycleState) + Send + Sync + 'static) {
        *self.notify_state.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn name(&self) -> &'static str {
        COMPONENT_NAME
    }

    pub(crate) fn config(&self) -> Arc<DiscoveryConfig> {
        self.config.clone()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Wait until the component reaches the given state.
    pub async fn wait_for(&self, target: LifecycleState) {
        loop {
            // Register interest before checking, otherwise a transition
            // between the check and the await is lost.
            let mut notified = std::pin::pin!(self.state_changed.notified());
            notified.as_mut().enable();
            if self.inner.lock().await.state == target {
                return;
            }
            notified.await;
        }
    }

    /// Start the component.
    ///
    /// Valid only while stopped. Activates the cleanup task and, when mDNS
    /// is enabled and a multicast transport was provided, the advertiser.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Stopped {
            return Err(DiscoveryError::InvalidState("component is not stopped"));
        }

        // Boot multicast first. It is the only fallible step; a failure must
        // leave the component stopped with nothing scheduled.
        if self.config.mdns_enabled {
            match &self.mdns_transport {
                Some(transport) => self.boot_multicast(&mut inner, transport.clone())?,
                None => warn!("mDNS is enabled but no multicast transport was provided"),
            }
        }

        let shutdown = Arc::new(Notify::new());
        inner.ticker_shutdown = Some(shutdown.clone());
        let dm = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        dm.run_cleanup().await;
                    }
                    _ = shutdown.notified() => {
                        debug!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        self.set_state_locked(&mut inner, LifecycleState::Started);
        info!("Discovery manager started");
        Ok(())
    }

    /// Stop the component.
    ///
    /// Cancels every outstanding register request and shuts the advertiser
    /// down. The component reaches `Stopped` once all of them have drained;
    /// until then it reports `Stopping`.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Started {
            return;
        }

        if let Some(shutdown) = inner.ticker_shutdown.take() {
            shutdown.notify_one();
        }

        // Cancel all outstanding register requests
        for slot in inner.slots.iter().flatten() {
            let _ = slot.commands.send(ChannelCommand::Disconnect);
        }

        if let Some(adv) = inner.multicast.as_mut() {
            adv.stop();
        }

        self.set_state_locked(&mut inner, LifecycleState::Stopped);
        info!("Discovery manager {}", inner.state);
    }

    /// Release the component's resources.
    ///
    /// Allowed only once the component reports `Stopped`.
    pub async fn free(&self) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Stopped {
            error!("Cannot delete the discovery manager because it is not stopped");
            return Err(DiscoveryError::InvalidState("component is not stopped"));
        }
        inner.registry.clear();
        inner.multicast = None;
        Ok(())
    }

    /// Register this server at a remote discovery server.
    ///
    /// The client config is consumed. Setup is synchronous; the registration
    /// itself completes asynchronously and is not retried on failure, the
    /// caller re-invokes when needed.
    pub async fn register_discovery(
        &self,
        client_config: ClientConfig,
        discovery_server_url: &str,
        semaphore_file_path: &str,
    ) -> Result<(), DiscoveryError> {
        info!("Registering at the discovery server: {}", discovery_server_url);
        self.register(client_config, false, discovery_server_url, semaphore_file_path)
            .await
    }

    /// Deregister this server from a remote discovery server.
    ///
    /// Same slot and channel mechanics as `register_discovery`, with an
    /// offline registration body and no semaphore file.
    pub async fn deregister_discovery(
        &self,
        client_config: ClientConfig,
        discovery_server_url: &str,
    ) -> Result<(), DiscoveryError> {
        info!(
            "Deregistering at the discovery server: {}",
            discovery_server_url
        );
        self.register(client_config, true, discovery_server_url, "")
            .await
    }

    async fn register(
        &self,
        mut client_config: ClientConfig,
        unregister: bool,
        discovery_server_url: &str,
        semaphore_file_path: &str,
    ) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock().await;

        if inner.state != LifecycleState::Started {
            error!("The discovery manager must be started for registering");
            return Err(DiscoveryError::InvalidState("component is not started"));
        }

        // Find a free slot for the request
        let Some(slot) = inner.slots.iter().position(Option::is_none) else {
            error!("Too many outstanding register requests. Cannot proceed.");
            return Err(DiscoveryError::PoolExhausted);
        };

        // Adopt the caller's client configuration
        if self.config.encryption {
            client_config.security_mode = MessageSecurityMode::SignAndEncrypt;
        }
        client_config.no_session = true;
        client_config.endpoint_url = discovery_server_url.to_string();

        // Connect asynchronously. The register service is called once the
        // channel is open.
        let handle = self.connector.open(client_config)?;

        inner.slots[slot] = Some(RegisterSlot {
            commands: handle.commands.clone(),
            endpoint_url: discovery_server_url.to_string(),
        });

        tokio::spawn(register::run_register_session(
            self.clone(),
            slot,
            handle.events,
            handle.commands,
            unregister,
            semaphore_file_path.to_string(),
        ));
        Ok(())
    }

    /// Apply an inbound registration request to the table. This is the entry
    /// point of the `RegisterServer` / `RegisterServer2` service handlers.
    pub async fn apply_registration(&self, server: RegisteredServer) -> StatusCode {
        let mut inner = self.inner.lock().await;
        inner.registry.apply_registration(server, self.probe.as_ref())
    }

    /// Number of currently registered peer servers.
    pub async fn registered_server_count(&self) -> usize {
        self.inner.lock().await.registry.len()
    }

    /// Snapshot of the registered peer servers.
    pub async fn registered_servers(&self) -> Vec<RegisteredServer> {
        let inner = self.inner.lock().await;
        inner.registry.servers().map(|e| e.server.clone()).collect()
    }

    /// Number of occupied outbound register slots.
    pub async fn occupied_slots(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Number of servers observed on the network via mDNS.
    pub async fn servers_on_network_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.multicast.as_ref().map_or(0, |adv| adv.records.len())
    }

    /// One pass of the periodic cleanup: age out registrations, then let the
    /// advertiser flush scheduled announcements.
    async fn run_cleanup(&self) {
        let mut inner = self.inner.lock().await;
        inner
            .registry
            .sweep(self.config.cleanup_timeout(), self.probe.as_ref());

        if let Some(adv) = inner.multicast.as_mut() {
            adv.send_scheduled(&self.config.mdns);
        }
    }

    fn boot_multicast(
        &self,
        inner: &mut Inner,
        transport: Arc<dyn MdnsTransport>,
    ) -> Result<(), DiscoveryError> {
        // Open every connection before spawning anything, so a failed open
        // leaves no task behind and the channels already handed out are
        // simply dropped again.
        let send = transport.open_send()?;
        let recv = transport.open_recv()?;

        let mut adv = MulticastAdvertiser::new(self.config.mdns_server_name());

        let handle = ConnectionHandle::new(send.commands);
        tokio::spawn(run_mdns_connection(
            self.clone(),
            send.events,
            handle.open.clone(),
        ));
        adv.attach_send(handle);

        for channel in recv {
            let handle = ConnectionHandle::new(channel.commands);
            tokio::spawn(run_mdns_connection(
                self.clone(),
                channel.events,
                handle.open.clone(),
            ));
            adv.attach_recv(handle);
        }

        inner.multicast = Some(adv);
        info!("Multicast discovery started");
        Ok(())
    }

    /// Recompute the lifecycle state.
    ///
    /// A `Stopping`/`Stopped` target is downgraded to `Stopping` while any
    /// outbound client or multicast connection is still live. Nothing
    /// happens on a self-transition; real transitions pulse `state_changed`
    /// and invoke the installed hook.
    fn set_state_locked(&self, inner: &mut Inner, target: LifecycleState) {
        let mut state = target;
        if matches!(state, LifecycleState::Stopping | LifecycleState::Stopped) {
            state = LifecycleState::Stopped;
            if let Some(adv) = inner.multicast.as_mut() {
                if adv.live_connections() != 0 {
                    state = LifecycleState::Stopping;
                }
            }
            if inner.slots.iter().any(Option::is_some) {
                state = LifecycleState::Stopping;
            }
        }

        // No change
        if state == inner.state {
            return;
        }

        inner.state = state;
        debug!("Discovery manager state: {}", state);
        self.state_changed.notify_waiters();
        if let Some(hook) = self.notify_state.lock().unwrap().as_ref() {
            hook(state);
        }
    }

    /// Reclaim a register slot after its session finished, then re-check the
    /// drain condition.
    pub(crate) async fn reclaim_slot(&self, slot: usize) {
        let mut inner = self.inner.lock().await;
        inner.slots[slot] = None;
        let current = inner.state;
        self.set_state_locked(&mut inner, current);
    }
}

/// Connection task for one mDNS connection. Receive connections feed the
/// server-on-network table; the task ending means the connection closed, at
/// which point the drain gate is re-entered.
async fn run_mdns_connection(
    dm: DiscoveryManager,
    mut events: mpsc::Receiver<MdnsEvent>,
    open: Arc<std::sync::atomic::AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        let mut inner = dm.inner.lock().await;
        let Some(adv) = inner.multicast.as_mut() else {
            continue;
        };
        match event {
            MdnsEvent::ServerFound {
                server_name,
                discovery_url,
                server_capabilities,
            } => {
                if let Some(id) = adv.records.observe(&server_name, &discovery_url, server_capabilities)
                {
                    info!(
                        "Discovered server '{}' at {} (record {})",
                        server_name, discovery_url, id
                    );
                }
            }
            MdnsEvent::ServerGone {
                server_name,
                discovery_url,
            } => {
                if adv.records.remove(&server_name, &discovery_url) {
                    info!("Server '{}' at {} left the network", server_name, discovery_url);
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let mut inner = dm.inner.lock().await;
    let current = inner.state;
    dm.set_state_locked(&mut inner, current);
}

/// Discovery manager error types.
#[derive(Debug)]
pub enum DiscoveryError {
    /// The operation is not valid in the current lifecycle state.
    InvalidState(&'static str),
    /// All register slots are occupied.
    PoolExhausted,
    /// A resource (memory, sockets) could not be obtained.
    Resource(String),
    /// The transport could not set up a channel.
    Transport(String),
    /// The configuration failed validation.
    Config(String),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState(s) => write!(f, "Invalid state: {}", s),
            Self::PoolExhausted => write!(f, "Too many outstanding register requests"),
            Self::Resource(s) => write!(f, "Resource error: {}", s),
            Self::Transport(s) => write!(f, "Transport error: {}", s),
            Self::Config(s) => write!(f, "Configuration error: {}", s),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<TransportError> for DiscoveryError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Resource(s) => Self::Resource(s),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LocalizedText, SecureChannelState};
    use crate::transport::testing::{state_event, ScriptedConnector};
    use super::multicast::MdnsChannel;
    use std::sync::Mutex as StdMutex;

    fn test_config() -> DiscoveryConfig {
        let mut config = DiscoveryConfig::default();
        config.application.application_uri = "urn:test:server".into();
        config.application.discovery_urls = vec!["opc.tcp://me:4840".into()];
        config
    }

    fn manager_with_connector() -> (DiscoveryManager, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new());
        let dm = DiscoveryManager::new(test_config(), connector.clone()).unwrap();
        (dm, connector)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (dm, _connector) = manager_with_connector();
        assert_eq!(dm.state().await, LifecycleState::Stopped);

        dm.start().await.unwrap();
        assert_eq!(dm.state().await, LifecycleState::Started);

        // Starting twice is a lifecycle violation
        assert!(matches!(
            dm.start().await,
            Err(DiscoveryError::InvalidState(_))
        ));

        dm.stop().await;
        assert_eq!(dm.state().await, LifecycleState::Stopped);
        dm.free().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_requires_started_component() {
        let (dm, connector) = manager_with_connector();

        let result = dm
            .register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
            .await;
        assert!(matches!(result, Err(DiscoveryError::InvalidState(_))));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_pool_saturation() {
        let (dm, connector) = manager_with_connector();
        dm.start().await.unwrap();

        for _ in 0..MAX_REGISTER_REQUESTS {
            dm.register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
                .await
                .unwrap();
        }
        assert_eq!(dm.occupied_slots().await, MAX_REGISTER_REQUESTS);

        // The next request finds no free slot and does not consume one
        let result = dm
            .register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
            .await;
        assert!(matches!(result, Err(DiscoveryError::PoolExhausted)));
        assert_eq!(dm.occupied_slots().await, MAX_REGISTER_REQUESTS);
        assert_eq!(connector.opened(), MAX_REGISTER_REQUESTS);
    }

    #[tokio::test]
    async fn test_stop_drains_outstanding_registrations() {
        let (dm, connector) = manager_with_connector();
        dm.start().await.unwrap();

        let states: Arc<StdMutex<Vec<LifecycleState>>> = Arc::new(StdMutex::new(Vec::new()));
        let recorded = states.clone();
        dm.set_state_hook(move |state| recorded.lock().unwrap().push(state));

        dm.register_discovery(ClientConfig::default(), "opc.tcp://disc1:4840", "")
            .await
            .unwrap();
        dm.register_discovery(ClientConfig::default(), "opc.tcp://disc2:4840", "")
            .await
            .unwrap();
        let mut first = connector.take_channel();
        let mut second = connector.take_channel();

        dm.stop().await;
        assert_eq!(dm.state().await, LifecycleState::Stopping);

        // Both clients received the asynchronous disconnect
        assert!(matches!(
            first.commands.recv().await,
            Some(ChannelCommand::Disconnect)
        ));
        assert!(matches!(
            second.commands.recv().await,
            Some(ChannelCommand::Disconnect)
        ));

        // Destruction is rejected until the drain completes
        assert!(matches!(
            dm.free().await,
            Err(DiscoveryError::InvalidState(_))
        ));

        // First channel confirms the close: still draining
        first
            .events
            .send(state_event(
                SecureChannelState::Closed,
                StatusCode::BAD_CONNECTION_CLOSED,
                MessageSecurityMode::Invalid,
            ))
            .await
            .unwrap();
        drop(first);

        tokio::time::timeout(Duration::from_secs(1), async {
            while dm.occupied_slots().await != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(dm.state().await, LifecycleState::Stopping);

        // Second close completes the drain
        second
            .events
            .send(state_event(
                SecureChannelState::Closed,
                StatusCode::BAD_CONNECTION_CLOSED,
                MessageSecurityMode::Invalid,
            ))
            .await
            .unwrap();
        drop(second);

        tokio::time::timeout(Duration::from_secs(1), dm.wait_for(LifecycleState::Stopped))
            .await
            .unwrap();
        dm.free().await.unwrap();

        // Strict transitions only, each reported exactly once
        let states = states.lock().unwrap();
        assert_eq!(
            *states,
            vec![LifecycleState::Stopping, LifecycleState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_state_hook_fires_on_every_transition() {
        let (dm, _connector) = manager_with_connector();

        let states: Arc<StdMutex<Vec<LifecycleState>>> = Arc::new(StdMutex::new(Vec::new()));
        let recorded = states.clone();
        dm.set_state_hook(move |state| recorded.lock().unwrap().push(state));

        dm.start().await.unwrap();
        dm.stop().await;
        dm.start().await.unwrap();
        dm.stop().await;

        let states = states.lock().unwrap();
        assert_eq!(
            *states,
            vec![
                LifecycleState::Started,
                LifecycleState::Stopped,
                LifecycleState::Started,
                LifecycleState::Stopped,
            ]
        );
        for pair in states.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_register_then_deregister_leaves_pool_clean() {
        let (dm, connector) = manager_with_connector();
        dm.start().await.unwrap();

        for unregister in [false, true] {
            if unregister {
                dm.deregister_discovery(ClientConfig::default(), "opc.tcp://disc:4840")
                    .await
                    .unwrap();
            } else {
                dm.register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
                    .await
                    .unwrap();
            }
            let channel = connector.take_channel();
            channel
                .events
                .send(state_event(
                    SecureChannelState::Closed,
                    StatusCode::BAD_CONNECTION_CLOSED,
                    MessageSecurityMode::Invalid,
                ))
                .await
                .unwrap();
            drop(channel);
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while dm.occupied_slots().await != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(dm.state().await, LifecycleState::Started);
    }

    #[tokio::test]
    async fn test_inbound_registration_and_count() {
        let (dm, _connector) = manager_with_connector();
        dm.start().await.unwrap();

        let server = RegisteredServer {
            server_uri: "urn:peer".into(),
            server_names: vec![LocalizedText::new("en", "Peer")],
            discovery_urls: vec!["opc.tcp://peer:4840".into()],
            is_online: true,
            ..Default::default()
        };
        assert_eq!(dm.apply_registration(server.clone()).await, StatusCode::GOOD);
        assert_eq!(dm.registered_server_count().await, 1);

        let mut offline = server;
        offline.is_online = false;
        assert_eq!(dm.apply_registration(offline).await, StatusCode::GOOD);
        assert_eq!(dm.registered_server_count().await, 0);
    }

    // --- multicast lifecycle ---

    struct FakeMdnsState {
        channels: Vec<(mpsc::UnboundedReceiver<multicast::MdnsCommand>, mpsc::Sender<MdnsEvent>)>,
    }

    /// Multicast transport whose far ends stay in the hands of the test.
    struct FakeMdnsTransport {
        recv_connections: usize,
        state: StdMutex<FakeMdnsState>,
    }

    impl FakeMdnsTransport {
        fn new(recv_connections: usize) -> Self {
            Self {
                recv_connections,
                state: StdMutex::new(FakeMdnsState { channels: Vec::new() }),
            }
        }

        fn open_one(&self) -> MdnsChannel {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (ev_tx, ev_rx) = mpsc::channel(16);
            self.state.lock().unwrap().channels.push((cmd_rx, ev_tx));
            MdnsChannel {
                commands: cmd_tx,
                events: ev_rx,
            }
        }

        /// Confirm all pending close requests by dropping the event senders.
        fn complete_closes(&self) {
            self.state.lock().unwrap().channels.clear();
        }

        fn event_sender(&self, index: usize) -> mpsc::Sender<MdnsEvent> {
            self.state.lock().unwrap().channels[index].1.clone()
        }
    }

    impl multicast::MdnsTransport for FakeMdnsTransport {
        fn open_send(&self) -> Result<MdnsChannel, TransportError> {
            Ok(self.open_one())
        }

        fn open_recv(&self) -> Result<Vec<MdnsChannel>, TransportError> {
            Ok((0..self.recv_connections).map(|_| self.open_one()).collect())
        }
    }

    fn mdns_config() -> DiscoveryConfig {
        let mut config = test_config();
        config.mdns_enabled = true;
        config.mdns.server_name = "lds".into();
        config
    }

    #[tokio::test]
    async fn test_multicast_observations_feed_the_table() {
        let connector = Arc::new(ScriptedConnector::new());
        let mdns = Arc::new(FakeMdnsTransport::new(1));
        let dm = DiscoveryManager::new(mdns_config(), connector)
            .unwrap()
            .with_mdns_transport(mdns.clone());

        dm.start().await.unwrap();

        // Index 1 is the first receive connection (0 is the send side)
        let events = mdns.event_sender(1);
        events
            .send(MdnsEvent::ServerFound {
                server_name: "peer".into(),
                discovery_url: "opc.tcp://peer:4840".into(),
                server_capabilities: vec!["LDS".into()],
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while dm.servers_on_network_count().await != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        events
            .send(MdnsEvent::ServerGone {
                server_name: "peer".into(),
                discovery_url: "opc.tcp://peer:4840".into(),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while dm.servers_on_network_count().await != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        drop(events);

        dm.stop().await;
        mdns.complete_closes();
        tokio::time::timeout(Duration::from_secs(1), dm.wait_for(LifecycleState::Stopped))
            .await
            .unwrap();
    }

    /// Fails the first `open_send`, then behaves like the fake.
    struct FlakyMdnsTransport {
        send_failures: std::sync::atomic::AtomicUsize,
        fake: FakeMdnsTransport,
    }

    impl multicast::MdnsTransport for FlakyMdnsTransport {
        fn open_send(&self) -> Result<MdnsChannel, TransportError> {
            if self.send_failures.load(Ordering::SeqCst) > 0 {
                self.send_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Io("no multicast interface".into()));
            }
            self.fake.open_send()
        }

        fn open_recv(&self) -> Result<Vec<MdnsChannel>, TransportError> {
            self.fake.open_recv()
        }
    }

    /// Hands out a working send connection, then fails the receive side.
    struct RecvFailingMdnsTransport {
        fake: FakeMdnsTransport,
    }

    impl multicast::MdnsTransport for RecvFailingMdnsTransport {
        fn open_send(&self) -> Result<MdnsChannel, TransportError> {
            self.fake.open_send()
        }

        fn open_recv(&self) -> Result<Vec<MdnsChannel>, TransportError> {
            Err(TransportError::Io("receive sockets unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_multicast_boot_leaves_component_stopped() {
        let connector = Arc::new(ScriptedConnector::new());
        let mdns = Arc::new(FlakyMdnsTransport {
            send_failures: std::sync::atomic::AtomicUsize::new(1),
            fake: FakeMdnsTransport::new(1),
        });
        let dm = DiscoveryManager::new(mdns_config(), connector)
            .unwrap()
            .with_mdns_transport(mdns.clone());

        // The first start cannot open the send connection and schedules
        // nothing
        assert!(matches!(
            dm.start().await,
            Err(DiscoveryError::Transport(_))
        ));
        assert_eq!(dm.state().await, LifecycleState::Stopped);
        assert_eq!(dm.servers_on_network_count().await, 0);

        // stop stays a no-op in Stopped
        dm.stop().await;
        assert_eq!(dm.state().await, LifecycleState::Stopped);

        // Once the transport recovers the component starts normally
        dm.start().await.unwrap();
        assert_eq!(dm.state().await, LifecycleState::Started);

        dm.stop().await;
        mdns.fake.complete_closes();
        tokio::time::timeout(Duration::from_secs(1), dm.wait_for(LifecycleState::Stopped))
            .await
            .unwrap();
        dm.free().await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_open_failure_releases_send_connection() {
        let connector = Arc::new(ScriptedConnector::new());
        let mdns = Arc::new(RecvFailingMdnsTransport {
            fake: FakeMdnsTransport::new(0),
        });
        let dm = DiscoveryManager::new(mdns_config(), connector)
            .unwrap()
            .with_mdns_transport(mdns.clone());

        assert!(matches!(
            dm.start().await,
            Err(DiscoveryError::Transport(_))
        ));
        assert_eq!(dm.state().await, LifecycleState::Stopped);

        // The send channel handed out before the failure was dropped again,
        // no task holds its receive side
        assert!(mdns.fake.event_sender(0).is_closed());
        assert_eq!(dm.servers_on_network_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_multicast_connections() {
        let connector = Arc::new(ScriptedConnector::new());
        let mdns = Arc::new(FakeMdnsTransport::new(2));
        let dm = DiscoveryManager::new(mdns_config(), connector)
            .unwrap()
            .with_mdns_transport(mdns.clone());

        dm.start().await.unwrap();
        dm.stop().await;

        // Connections are still closing
        assert_eq!(dm.state().await, LifecycleState::Stopping);
        assert!(matches!(
            dm.free().await,
            Err(DiscoveryError::InvalidState(_))
        ));

        mdns.complete_closes();
        tokio::time::timeout(Duration::from_secs(1), dm.wait_for(LifecycleState::Stopped))
            .await
            .unwrap();
        dm.free().await.unwrap();
    }
}
