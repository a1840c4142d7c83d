// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Secure channel transport contract for outbound register clients.
//!
//! The register pool does not speak the wire itself. It hands a
//! [`ClientConfig`] to a [`ChannelConnector`] and drives the resulting
//! channel through a command sender and an event receiver. Connection
//! progress arrives as [`ChannelEvent::State`] observations carrying the
//! `(channel, session, connect status)` triple plus the security mode
//! currently in effect; service responses arrive as their own events.

use crate::protocol::{
    MessageSecurityMode, RegisterServer2Request, RegisterServer2Response, RegisterServerRequest,
    RegisterServerResponse, SecureChannelState, SessionState, StatusCode,
};
use std::time::Duration;
use tokio::sync::mpsc;

pub mod mdns;
pub mod tcp;

/// Buffered events per channel before the transport backpressures.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Per-connection client configuration.
///
/// Callers hand this to `register_discovery`, which adopts it: the security
/// mode, session flag and endpoint URL are overwritten before the channel is
/// opened. The config is consumed either way.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Target endpoint URL; set by the register pool.
    pub endpoint_url: String,

    /// Requested security mode for the channel.
    pub security_mode: MessageSecurityMode,

    /// When set, only a secure channel is opened and no session is created.
    pub no_session: bool,

    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            security_mode: MessageSecurityMode::None,
            no_session: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Commands issued on an open channel. All of them complete asynchronously
/// via [`ChannelEvent`]s.
#[derive(Debug)]
pub enum ChannelCommand {
    Register(RegisterServerRequest),
    Register2(RegisterServer2Request),
    /// Close the secure channel. The final `Closed` state observation
    /// follows once teardown completes.
    Disconnect,
}

/// One connection state observation.
#[derive(Debug, Clone, Copy)]
pub struct ChannelState {
    pub channel: SecureChannelState,
    pub session: SessionState,
    pub connect_status: StatusCode,
    /// Security mode in effect on the channel at this point.
    pub security_mode: MessageSecurityMode,
}

/// Events reported by the transport to the owning register slot.
#[derive(Debug)]
pub enum ChannelEvent {
    State(ChannelState),
    RegisterResponse(RegisterServerResponse),
    Register2Response(RegisterServer2Response),
}

/// Handle to an opened channel.
pub struct ChannelHandle {
    pub commands: mpsc::UnboundedSender<ChannelCommand>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Opens asynchronous secure channels.
///
/// `open` returns as soon as the channel machinery is set up; connection
/// progress and failures are reported through the handle's event stream.
pub trait ChannelConnector: Send + Sync {
    fn open(&self, config: ClientConfig) -> Result<ChannelHandle, TransportError>;
}

/// Transport error types.
#[derive(Debug)]
pub enum TransportError {
    InvalidUrl(String),
    Io(String),
    Resource(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(s) => write!(f, "Invalid endpoint URL: {}", s),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Resource(s) => write!(f, "Resource error: {}", s),
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted connector for driving the register state machine in tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// The test-side end of a scripted channel.
    pub(crate) struct ScriptedChannel {
        pub config: ClientConfig,
        pub commands: mpsc::UnboundedReceiver<ChannelCommand>,
        pub events: mpsc::Sender<ChannelEvent>,
    }

    /// Connector that hands out channels whose far end is owned by the test.
    /// Channels stay open until the test drops the event sender or scripts a
    /// closing state observation.
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        channels: Mutex<VecDeque<ScriptedChannel>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Take the channel created by the oldest unclaimed `open` call.
        pub(crate) fn take_channel(&self) -> ScriptedChannel {
            self.channels
                .lock()
                .unwrap()
                .pop_front()
                .expect("no channel was opened")
        }

        pub(crate) fn opened(&self) -> usize {
            self.channels.lock().unwrap().len()
        }
    }

    impl ChannelConnector for ScriptedConnector {
        fn open(&self, config: ClientConfig) -> Result<ChannelHandle, TransportError> {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (ev_tx, ev_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            self.channels.lock().unwrap().push_back(ScriptedChannel {
                config,
                commands: cmd_rx,
                events: ev_tx,
            });
            Ok(ChannelHandle {
                commands: cmd_tx,
                events: ev_rx,
            })
        }
    }

    /// Shorthand for a state observation event.
    pub(crate) fn state_event(
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
}
