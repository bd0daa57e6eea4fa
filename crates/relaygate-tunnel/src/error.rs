//! Error types for tunnel operations

use thiserror::Error;

/// Errors that can occur while setting up or running a tunnel session
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Invalid construction arguments (blank identifiers, bad ports, closed relay)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Socket bind/connect or relay channel setup failed while initializing a session
    #[error("Gateway initialization error: {message}")]
    GatewayInit {
        /// Error message describing what failed
        message: String,
    },

    /// Socket I/O error (connection refused, reset, closed)
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Relay transport error (send/receive failure, closed relay connection)
    #[error("Relay error: {message}")]
    Relay {
        /// Error message describing the relay failure
        message: String,
    },

    /// Peer or relay inconsistency (unexpected control message, queue id mismatch)
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol violation
        message: String,
    },

    /// Certificate, key or verifier construction failure
    #[error("TLS error: {message}")]
    Tls {
        /// Error message describing the TLS issue
        message: String,
    },

    /// Operation invoked in a lifecycle state that does not allow it
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message describing the violated ordering
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl TunnelError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new gateway initialization error
    #[must_use]
    pub fn gateway_init(message: impl Into<String>) -> Self {
        Self::GatewayInit {
            message: message.into(),
        }
    }

    /// Create a new relay error
    #[must_use]
    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new TLS error
    #[must_use]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a new invalid state error
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Whether this error points at a peer or relay inconsistency rather than a local fault
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Whether the relay broker rejected or lost an operation
    #[must_use]
    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay { .. })
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
