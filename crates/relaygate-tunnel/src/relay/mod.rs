//! Relay client interface consumed by the tunnel core
//!
//! The relay broker is the rendezvous point both gateways can reach. The core only
//! needs the operations on [`RelayClient`]; the broker's wire protocol and payload
//! encryption stay behind that trait. [`memory::MemoryRelay`] is an in-process
//! implementation.
//!
//! # Channels
//!
//! Every session owns four channels derived from its queue id:
//!
//! ```text
//! consumer --REQ-<queue_id>---------> provider     data
//! consumer --REQ-<queue_id>-CONTROL-> provider     control
//! consumer <-RESP-<queue_id>--------- provider     data
//! consumer <-RESP-<queue_id>-CONTROL- provider     control
//! ```

pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::session::PeerPublicKey;
use crate::{Result, TunnelError};

pub use memory::MemoryRelay;

/// Reserved suffix marking a control channel
pub const CONTROL_SUFFIX: &str = "-CONTROL";

const REQUEST_PREFIX: &str = "REQ-";
const RESPONSE_PREFIX: &str = "RESP-";

/// Check whether a channel name denotes a control channel
#[must_use]
pub fn is_control_channel(channel: &str) -> bool {
    channel.ends_with(CONTROL_SUFFIX)
}

/// Extract the queue id a channel name belongs to
#[must_use]
pub fn queue_id_of(channel: &str) -> Option<&str> {
    let name = channel.strip_suffix(CONTROL_SUFFIX).unwrap_or(channel);
    name.strip_prefix(REQUEST_PREFIX)
        .or_else(|| name.strip_prefix(RESPONSE_PREFIX))
        .filter(|id| !id.is_empty())
}

// =============================================================================
// Session Side and Channels
// =============================================================================

/// Which end of the tunnel a gateway plays for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Terminates the consumer's TLS connection
    Consumer,
    /// Connects out to the provider
    Provider,
}

/// Channel names one side of a session sends on and receives from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionChannels {
    /// Session queue id
    pub queue_id: String,
    /// Data channel this side sends chunks on
    pub send_data: String,
    /// Control channel this side sends signals on
    pub send_control: String,
    /// Data channel this side receives chunks from
    pub recv_data: String,
    /// Control channel this side receives signals from
    pub recv_control: String,
}

impl SessionChannels {
    /// Derive the channel names for `side` of session `queue_id`
    #[must_use]
    pub fn for_side(queue_id: &str, side: Side) -> Self {
        let request = format!("{REQUEST_PREFIX}{queue_id}");
        let response = format!("{RESPONSE_PREFIX}{queue_id}");
        let (send, recv) = match side {
            Side::Consumer => (request, response),
            Side::Provider => (response, request),
        };
        Self {
            queue_id: queue_id.to_string(),
            send_control: format!("{send}{CONTROL_SUFFIX}"),
            recv_control: format!("{recv}{CONTROL_SUFFIX}"),
            send_data: send,
            recv_data: recv,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Kind of a control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Tear the session down
    Close,
    /// The provider side replaced its outbound socket
    Switch,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Close => "CLOSE",
            Self::Switch => "SWITCH",
        })
    }
}

impl FromStr for ControlKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CLOSE" => Ok(Self::Close),
            "SWITCH" => Ok(Self::Switch),
            other => Err(TunnelError::protocol(format!(
                "unknown control message type: {other}"
            ))),
        }
    }
}

/// One message delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    channel: String,
    payload: Bytes,
}

impl RelayMessage {
    /// Create a message received on `channel`
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Channel the message arrived on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Raw payload as carried by the relay
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

/// Handle to a transport session with the relay broker
///
/// Cheap to clone. Several tunnel sessions may share one connection; whether it can
/// be closed is decided by [`RelayClient::destroy_queues`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayConnection {
    id: Uuid,
    host: String,
    port: u16,
    secure: bool,
}

impl RelayConnection {
    /// Create a handle for a freshly opened connection
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            port,
            secure,
        }
    }

    /// Unique connection identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Broker host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Broker port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection runs over TLS
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Receives the messages of one session side
///
/// Implemented by consumer-side workers and provider-side handlers. A relay client
/// delivers the messages of one subscription one at a time.
#[async_trait]
pub trait RelayMessageListener: Send + Sync {
    /// Handle one message from the session's data or control channel
    async fn on_message(&self, message: RelayMessage);
}

/// Operations the tunnel core needs from the relay broker
///
/// Every fallible operation may fail with [`TunnelError::Relay`]; callers treat that
/// as fatal to the current session only.
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    /// Open a transport session with the broker
    async fn create_connection(&self, host: &str, port: u16, secure: bool)
        -> Result<RelayConnection>;

    /// Whether the connection is closed
    fn is_connection_closed(&self, connection: &RelayConnection) -> bool;

    /// Close the connection; failures are logged, not returned
    async fn close_connection(&self, connection: &RelayConnection);

    /// Create the channels of one side of a session and subscribe `listener` to the
    /// channels that side receives from
    async fn open_session_channels(
        &self,
        connection: &RelayConnection,
        queue_id: &str,
        side: Side,
        listener: Arc<dyn RelayMessageListener>,
    ) -> Result<SessionChannels>;

    /// Send one chunk of the tunneled stream to the peer
    async fn send_bytes(
        &self,
        connection: &RelayConnection,
        channel: &str,
        peer_key: &PeerPublicKey,
        bytes: &[u8],
    ) -> Result<()>;

    /// Decode the chunk carried by a data message
    fn get_bytes_from_message(
        &self,
        message: &RelayMessage,
        peer_key: &PeerPublicKey,
    ) -> Result<Bytes>;

    /// Whether a message arrived on a control channel
    fn is_control_message(&self, message: &RelayMessage) -> bool {
        is_control_channel(message.channel())
    }

    /// Decode the kind of a control message
    fn control_kind(&self, message: &RelayMessage) -> Result<ControlKind>;

    /// Validate a close signal against the channel it arrived on
    fn handle_close_control_message(
        &self,
        message: &RelayMessage,
        connection: &RelayConnection,
    ) -> Result<()>;

    /// Ask the peer to close session `queue_id`
    async fn send_close_control_message(
        &self,
        connection: &RelayConnection,
        channel: &str,
        queue_id: &str,
    ) -> Result<()>;

    /// Tell the peer the provider side switched sockets for session `queue_id`
    async fn send_switch_control_message(
        &self,
        connection: &RelayConnection,
        channel: &str,
        queue_id: &str,
    ) -> Result<()>;

    /// Stop delivering the session's messages to its listener
    async fn unsubscribe_from_queues(&self, connection: &RelayConnection, queue_id: &str)
        -> Result<()>;

    /// Destroy the session's channels
    ///
    /// Returns `true` when no session remains on `connection`, so it may be closed.
    async fn destroy_queues(&self, connection: &RelayConnection, queue_id: &str) -> Result<bool>;
}
