//! Session records, the shared session context and the connection request handed
//! to the provider side

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::registry::SessionRegistry;
use crate::relay::{RelayClient, RelayConnection};
use crate::tls::TlsContext;
use crate::{Result, TunnelError};

// =============================================================================
// Peer Public Key
// =============================================================================

/// Base64-encoded public key of the gateway on the other end of a session
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerPublicKey(String);

impl PeerPublicKey {
    /// Validate and wrap an encoded key
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the key is blank or not valid Base64.
    pub fn parse(encoded: impl Into<String>) -> Result<Self> {
        let encoded = encoded.into();
        let trimmed = encoded.trim();
        if trimmed.is_empty() {
            return Err(TunnelError::config("peer public key cannot be empty"));
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .map_err(|e| TunnelError::config(format!("peer public key is not decodable: {e}")))?;
        if decoded.is_empty() {
            return Err(TunnelError::config("peer public key decodes to nothing"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The encoded form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys are long; the head is enough to tell them apart in logs.
        let head: String = self.0.chars().take(12).collect();
        write!(f, "PeerPublicKey({head}..)")
    }
}

impl TryFrom<String> for PeerPublicKey {
    type Error = TunnelError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PeerPublicKey> for String {
    fn from(key: PeerPublicKey) -> Self {
        key.0
    }
}

// =============================================================================
// Active Session
// =============================================================================

/// Bookkeeping for one live tunnel, shared by its workers and the registry
#[derive(Debug)]
pub struct ActiveSession {
    /// Session/queue identifier
    pub queue_id: String,
    /// Public key of the peer gateway
    pub peer_key: PeerPublicKey,
    /// When the session was created
    pub created_at: Instant,
    last_interaction: Mutex<Instant>,
}

impl ActiveSession {
    /// Create a new session record
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the queue id is blank.
    pub fn new(queue_id: impl Into<String>, peer_key: PeerPublicKey) -> Result<Self> {
        let queue_id = queue_id.into();
        if queue_id.trim().is_empty() {
            return Err(TunnelError::config("queue id cannot be empty"));
        }
        let now = Instant::now();
        Ok(Self {
            queue_id,
            peer_key,
            created_at: now,
            last_interaction: Mutex::new(now),
        })
    }

    /// Update the last interaction timestamp
    pub fn touch(&self) {
        *self.last_interaction.lock() = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn touch_at(&self, at: Instant) {
        *self.last_interaction.lock() = at;
    }

    /// Get the last interaction timestamp
    #[must_use]
    pub fn last_interaction(&self) -> Instant {
        *self.last_interaction.lock()
    }

    /// Whether `now` lies strictly past the last interaction plus `threshold`
    #[must_use]
    pub fn is_idle_at(&self, now: Instant, threshold: Duration) -> bool {
        now > self.last_interaction() + threshold
    }
}

// =============================================================================
// Close Reason
// =============================================================================

/// Why a session side is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer sent a close control message
    PeerClosed,
    /// The local TLS peer closed its connection
    SocketClosed,
    /// Interrupted by the idle sweeper or a shutdown
    Interrupted,
    /// Idle past the provider-side threshold
    IdleTimeout,
    /// A bounded socket operation ran out of time
    Timeout,
    /// Socket or relay failure
    TransportError,
    /// Peer or relay inconsistency
    ProtocolError,
    /// Operation invoked out of lifecycle order
    InvalidState,
    /// Initialization failed and is being rolled back
    InitFailed,
    /// Closed on request of the gateway
    Requested,
}

impl CloseReason {
    /// Classify the error that ends a session
    #[must_use]
    pub fn from_error(error: &TunnelError) -> Self {
        match error {
            TunnelError::Timeout => Self::Timeout,
            TunnelError::Protocol { .. } => Self::ProtocolError,
            TunnelError::InvalidState { .. } => Self::InvalidState,
            TunnelError::GatewayInit { .. } => Self::InitFailed,
            _ => Self::TransportError,
        }
    }

    /// Whether the peer has to be told about the close
    ///
    /// Only a close the peer asked for goes unanswered.
    #[must_use]
    pub fn notifies_peer(self) -> bool {
        self != Self::PeerClosed
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PeerClosed => "peer closed",
            Self::SocketClosed => "socket closed",
            Self::Interrupted => "interrupted",
            Self::IdleTimeout => "idle timeout",
            Self::Timeout => "timeout",
            Self::TransportError => "transport error",
            Self::ProtocolError => "protocol error",
            Self::InvalidState => "invalid state",
            Self::InitFailed => "initialization failed",
            Self::Requested => "requested",
        })
    }
}

// =============================================================================
// Session Context
// =============================================================================

/// Collaborators every session side of a gateway works with
#[derive(Clone)]
pub struct SessionContext {
    /// Relay broker client
    pub relay: Arc<dyn RelayClient>,
    /// Relay connection the session runs over, possibly shared
    pub connection: RelayConnection,
    /// Registries of the owning gateway
    pub registry: Arc<SessionRegistry>,
    /// TLS acceptor and connector of the owning gateway
    pub tls: TlsContext,
    /// Timeouts, sizes and limits
    pub config: Arc<GatewayConfig>,
}

impl SessionContext {
    /// Check the parts of the context every session side relies on
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the relay connection is closed or the read
    /// timeout or chunk size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.relay.is_connection_closed(&self.connection) {
            return Err(TunnelError::config(format!(
                "relay connection {} is closed",
                self.connection.id()
            )));
        }
        if self.config.socket_read_timeout.is_zero() {
            return Err(TunnelError::config("socket read timeout must be positive"));
        }
        if self.config.max_chunk_size == 0 {
            return Err(TunnelError::config("max chunk size must be positive"));
        }
        Ok(())
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("connection", &self.connection)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Connection Request
// =============================================================================

/// The provider system a provider-side session connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    /// Provider system name
    pub system_name: String,
    /// Host name or IP address the provider listens on
    pub address: String,
    /// TLS port the provider listens on
    pub port: u16,
    /// Authentication info (the provider's public key)
    pub authentication_info: String,
}

/// Everything the provider side needs to open a tunnel to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// The provider to connect to
    pub provider: ProviderIdentity,
    /// Service definition being consumed
    pub service_definition: String,
    /// Public key of the consumer-side gateway
    pub consumer_gateway_public_key: String,
}

impl ConnectionRequest {
    /// Validate the request
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - the provider address or authentication info is blank
    /// - the provider port is 0
    /// - the service definition is blank
    /// - the consumer gateway public key is blank or not decodable
    pub fn validate(&self) -> Result<()> {
        if self.provider.address.trim().is_empty() {
            return Err(TunnelError::config("provider address cannot be empty"));
        }
        if self.provider.authentication_info.trim().is_empty() {
            return Err(TunnelError::config(
                "provider authentication info cannot be empty",
            ));
        }
        if self.provider.port == 0 {
            return Err(TunnelError::config("provider port must be in 1..=65535"));
        }
        if self.service_definition.trim().is_empty() {
            return Err(TunnelError::config("service definition cannot be empty"));
        }
        self.consumer_gateway_key().map(|_| ())
    }

    /// The consumer gateway key, validated
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the key is blank or not decodable.
    pub fn consumer_gateway_key(&self) -> Result<PeerPublicKey> {
        PeerPublicKey::parse(self.consumer_gateway_public_key.as_str())
    }
}
