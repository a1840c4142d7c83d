// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound registration against a remote discovery server.
//!
//! Each in-flight registration occupies one slot of a fixed pool and runs a
//! small session state machine over the transport's event stream: wait for
//! an open channel with an acceptable security mode, call `RegisterServer`,
//! fall back to `RegisterServer2` when the peer predates the service, then
//! disconnect. The slot is reclaimed only after the transport reports the
//! channel closed, and reclamation always happens on the session task, never
//! inside a transport callback.

use super::DiscoveryManager;
use crate::config::DiscoveryConfig;
use crate::protocol::{
    DiscoveryConfiguration, MdnsDiscoveryConfiguration, MessageSecurityMode,
    RegisterServer2Request, RegisterServerRequest, RegisteredServer, RequestHeader,
    SecureChannelState, StatusCode,
};
use crate::transport::{ChannelCommand, ChannelEvent};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Upper bound on concurrently outstanding register requests.
pub const MAX_REGISTER_REQUESTS: usize = 10;

/// Timeout hint placed in outbound request headers, in milliseconds.
pub(crate) const REGISTER_TIMEOUT_HINT_MS: u32 = 10_000;

/// An occupied slot of the register pool.
pub(crate) struct RegisterSlot {
    /// Command side of the slot's client channel, kept so `stop` can issue
    /// the asynchronous disconnect.
    pub(crate) commands: mpsc::UnboundedSender<ChannelCommand>,
    #[allow(dead_code)]
    pub(crate) endpoint_url: String,
}

/// Build the request header and body shared by both register services.
pub(crate) fn setup_register_request(
    config: &DiscoveryConfig,
    semaphore_file_path: &str,
    unregister: bool,
) -> (RequestHeader, RegisteredServer) {
    let app = &config.application;
    let header = RequestHeader {
        request_handle: 0,
        timeout_hint: REGISTER_TIMEOUT_HINT_MS,
    };
    let server = RegisteredServer {
        is_online: !unregister,
        server_uri: app.application_uri.clone(),
        product_uri: app.product_uri.clone(),
        server_type: app.application_type,
        gateway_server_uri: app.gateway_server_uri.clone(),
        semaphore_file_path: semaphore_file_path.to_string(),
        server_names: vec![app.application_name.clone()],
        // Mirror the discovery URLs as currently known
        discovery_urls: app.discovery_urls.clone(),
    };
    (header, server)
}

fn register2_request(
    config: &DiscoveryConfig,
    semaphore_file_path: &str,
    unregister: bool,
) -> RegisterServer2Request {
    let (request_header, server) = setup_register_request(config, semaphore_file_path, unregister);
    let mut discovery_configuration = Vec::new();
    if config.mdns_enabled {
        discovery_configuration.push(DiscoveryConfiguration::Mdns(MdnsDiscoveryConfiguration {
            mdns_server_name: config.mdns_server_name().to_string(),
            server_capabilities: config.mdns.server_capabilities.clone(),
        }));
    }
    RegisterServer2Request {
        request_header,
        server,
        discovery_configuration,
    }
}

/// Drive one outbound registration session to completion.
///
/// Runs until the transport ends the event stream or reports the channel
/// closed, then reclaims the slot and re-enters the lifecycle drain gate.
pub(crate) async fn run_register_session(
    dm: DiscoveryManager,
    slot: usize,
    mut events: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    unregister: bool,
    semaphore_file_path: String,
) {
    let config = dm.config();

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::State(state) => {
                // Connection failed
                if state.connect_status.is_bad() {
                    if state.connect_status != StatusCode::BAD_CONNECTION_CLOSED {
                        error!(
                            "Could not connect to the discovery server with error {}",
                            state.connect_status
                        );
                    }
                    // Once fully closed the slot can be reclaimed
                    if state.channel == SecureChannelState::Closed {
                        break;
                    }
                    continue;
                }

                // Wait until the secure channel is open
                if state.channel != SecureChannelState::Open {
                    continue;
                }

                // An unencrypted channel may precede the encrypted one during
                // the endpoint handshake; register only on the final mode.
                if config.encryption
                    && state.security_mode != MessageSecurityMode::SignAndEncrypt
                {
                    continue;
                }

                let (request_header, server) =
                    setup_register_request(&config, &semaphore_file_path, unregister);
                let request = RegisterServerRequest {
                    request_header,
                    server,
                };
                if commands.send(ChannelCommand::Register(request)).is_err() {
                    error!("RegisterServer could not be issued, the channel is gone");
                    break;
                }
            }

            ChannelEvent::RegisterResponse(response) => {
                let result = response.response_header.service_result;

                if result == StatusCode::GOOD {
                    info!("RegisterServer succeeded");
                    let _ = commands.send(ChannelCommand::Disconnect);
                    continue;
                }

                if result != StatusCode::BAD_NOT_IMPLEMENTED
                    && result != StatusCode::BAD_SERVICE_UNSUPPORTED
                {
                    warn!("RegisterServer failed with error {}", result);
                    let _ = commands.send(ChannelCommand::Disconnect);
                    continue;
                }

                // The peer predates RegisterServer; try RegisterServer2
                let request = register2_request(&config, &semaphore_file_path, unregister);
                if commands.send(ChannelCommand::Register2(request)).is_err() {
                    error!("RegisterServer2 could not be issued, the channel is gone");
                    break;
                }
            }

            ChannelEvent::Register2Response(response) => {
                let result = response.response_header.service_result;
                if result == StatusCode::GOOD {
                    info!("RegisterServer succeeded");
                } else {
                    warn!("RegisterServer failed with statuscode {}", result);
                }
                let _ = commands.send(ChannelCommand::Disconnect);
            }
        }
    }

    // Off the transport stack by construction: reclaim the slot and let the
    // lifecycle controller re-check the drain condition.
    dm.reclaim_slot(slot).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LifecycleState;
    use crate::protocol::{
        RegisterServer2Response, RegisterServerResponse, ResponseHeader, SessionState,
    };
    use crate::transport::testing::{state_event, ScriptedConnector};
    use crate::transport::{ChannelState, ClientConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> DiscoveryConfig {
        let mut config = DiscoveryConfig::default();
        config.application.application_uri = "urn:test:registrant".into();
        config.application.discovery_urls = vec!["opc.tcp://me:4840".into()];
        config
    }

    async fn started_manager(config: DiscoveryConfig) -> (DiscoveryManager, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new());
        let dm = DiscoveryManager::new(config, connector.clone()).unwrap();
        dm.start().await.unwrap();
        (dm, connector)
    }

    async fn expect_command(
        commands: &mut tokio::sync::mpsc::UnboundedReceiver<ChannelCommand>,
    ) -> ChannelCommand {
        tokio::time::timeout(Duration::from_secs(1), commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("command channel closed")
    }

    #[tokio::test]
    async fn test_happy_path_registration() {
        let (dm, connector) = started_manager(test_config()).await;

        dm.register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
            .await
            .unwrap();
        let mut channel = connector.take_channel();

        // The pool adopted the config before opening the channel
        assert_eq!(channel.config.endpoint_url, "opc.tcp://disc:4840");
        assert!(channel.config.no_session);
        assert_eq!(
            channel.config.security_mode,
            MessageSecurityMode::SignAndEncrypt
        );

        // Intermediate states are ignored
        channel
            .events
            .send(state_event(
                SecureChannelState::Connecting,
                StatusCode::GOOD,
                MessageSecurityMode::Invalid,
            ))
            .await
            .unwrap();
        channel
            .events
            .send(state_event(
                SecureChannelState::Open,
                StatusCode::GOOD,
                MessageSecurityMode::None,
            ))
            .await
            .unwrap();

        // The encrypted channel triggers RegisterServer
        channel
            .events
            .send(state_event(
                SecureChannelState::Open,
                StatusCode::GOOD,
                MessageSecurityMode::SignAndEncrypt,
            ))
            .await
            .unwrap();

        match expect_command(&mut channel.commands).await {
            ChannelCommand::Register(request) => {
                assert!(request.server.is_online);
                assert_eq!(request.server.server_uri, "urn:test:registrant");
                assert_eq!(request.server.server_names.len(), 1);
                assert_eq!(request.request_header.timeout_hint, 10_000);
            }
            other => panic!("Wrong command: {:?}", other),
        }

        // A good response disconnects the channel
        channel
            .events
            .send(ChannelEvent::RegisterResponse(RegisterServerResponse {
                response_header: ResponseHeader {
                    request_handle: 0,
                    service_result: StatusCode::GOOD,
                },
            }))
            .await
            .unwrap();
        assert!(matches!(
            expect_command(&mut channel.commands).await,
            ChannelCommand::Disconnect
        ));

        // The transport confirms the close; the slot drains
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
    async fn test_version_fallback_to_register_server2() {
        let mut config = test_config();
        config.mdns_enabled = true;
        config.mdns.server_name = "registrant".into();
        let (dm, connector) = started_manager(config).await;

        dm.register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
            .await
            .unwrap();
        let mut channel = connector.take_channel();

        channel
            .events
            .send(state_event(
                SecureChannelState::Open,
                StatusCode::GOOD,
                MessageSecurityMode::SignAndEncrypt,
            ))
            .await
            .unwrap();
        let first = match expect_command(&mut channel.commands).await {
            ChannelCommand::Register(request) => request,
            other => panic!("Wrong command: {:?}", other),
        };

        channel
            .events
            .send(ChannelEvent::RegisterResponse(RegisterServerResponse {
                response_header: ResponseHeader {
                    request_handle: 0,
                    service_result: StatusCode::BAD_SERVICE_UNSUPPORTED,
                },
            }))
            .await
            .unwrap();

        match expect_command(&mut channel.commands).await {
            ChannelCommand::Register2(request) => {
                // Same body, plus the mDNS extension
                assert_eq!(request.server.server_uri, first.server.server_uri);
                assert_eq!(request.discovery_configuration.len(), 1);
                let DiscoveryConfiguration::Mdns(mdns) = &request.discovery_configuration[0];
                assert_eq!(mdns.mdns_server_name, "registrant");
            }
            other => panic!("Wrong command: {:?}", other),
        }

        channel
            .events
            .send(ChannelEvent::Register2Response(RegisterServer2Response {
                response_header: ResponseHeader {
                    request_handle: 0,
                    service_result: StatusCode::GOOD,
                },
                configuration_results: vec![StatusCode::GOOD],
            }))
            .await
            .unwrap();
        assert!(matches!(
            expect_command(&mut channel.commands).await,
            ChannelCommand::Disconnect
        ));
    }

    #[tokio::test]
    async fn test_service_error_disconnects_without_retry() {
        let (dm, connector) = started_manager(test_config()).await;

        dm.register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
            .await
            .unwrap();
        let mut channel = connector.take_channel();

        channel
            .events
            .send(state_event(
                SecureChannelState::Open,
                StatusCode::GOOD,
                MessageSecurityMode::SignAndEncrypt,
            ))
            .await
            .unwrap();
        assert!(matches!(
            expect_command(&mut channel.commands).await,
            ChannelCommand::Register(_)
        ));

        channel
            .events
            .send(ChannelEvent::RegisterResponse(RegisterServerResponse {
                response_header: ResponseHeader {
                    request_handle: 0,
                    service_result: StatusCode::BAD_INTERNAL_ERROR,
                },
            }))
            .await
            .unwrap();

        // Teardown, not a retry
        assert!(matches!(
            expect_command(&mut channel.commands).await,
            ChannelCommand::Disconnect
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_reclaims_slot() {
        let (dm, connector) = started_manager(test_config()).await;

        dm.register_discovery(ClientConfig::default(), "opc.tcp://unreachable:4840", "")
            .await
            .unwrap();
        assert_eq!(dm.occupied_slots().await, 1);

        let channel = connector.take_channel();
        channel
            .events
            .send(state_event(
                SecureChannelState::Closed,
                StatusCode::BAD_CONNECTION_REJECTED,
                MessageSecurityMode::Invalid,
            ))
            .await
            .unwrap();
        drop(channel);

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
    async fn test_deregister_sends_offline_registration() {
        let (dm, connector) = started_manager(test_config()).await;

        dm.deregister_discovery(ClientConfig::default(), "opc.tcp://disc:4840")
            .await
            .unwrap();
        let mut channel = connector.take_channel();

        channel
            .events
            .send(state_event(
                SecureChannelState::Open,
                StatusCode::GOOD,
                MessageSecurityMode::SignAndEncrypt,
            ))
            .await
            .unwrap();

        match expect_command(&mut channel.commands).await {
            ChannelCommand::Register(request) => {
                assert!(!request.server.is_online);
                assert!(request.server.semaphore_file_path.is_empty());
            }
            other => panic!("Wrong command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unencrypted_channel_registers_without_encryption() {
        let mut config = test_config();
        config.encryption = false;
        let (dm, connector) = started_manager(config).await;

        dm.register_discovery(ClientConfig::default(), "opc.tcp://disc:4840", "")
            .await
            .unwrap();
        let mut channel = connector.take_channel();

        // Without the encryption requirement an open channel is enough
        channel
            .events
            .send(ChannelEvent::State(ChannelState {
                channel: SecureChannelState::Open,
                session: SessionState::Closed,
                connect_status: StatusCode::GOOD,
                security_mode: MessageSecurityMode::None,
            }))
            .await
            .unwrap();

        assert!(matches!(
            expect_command(&mut channel.commands).await,
            ChannelCommand::Register(_)
        ));
    }
}
