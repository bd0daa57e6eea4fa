//! Gateway entry point for session setup and teardown
//!
//! A [`Gateway`] owns the registries, the relay connection cache and the idle
//! sweeper of one gateway process. The collaborator that negotiates sessions calls
//! [`Gateway::connect_consumer`] or [`Gateway::connect_provider`] once the queue id
//! and public keys are agreed.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::consumer::{ConsumerSessionParams, ConsumerSideWorker};
use crate::provider::ProviderSideHandler;
use crate::registry::SessionRegistry;
use crate::relay::{RelayClient, RelayConnection};
use crate::session::{CloseReason, ConnectionRequest, PeerPublicKey, SessionContext};
use crate::sweeper::{ConnectionSweeper, SweeperConfig};
use crate::tls::TlsContext;
use crate::{Result, TunnelError};

/// Address of a relay broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayEndpoint {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Whether to connect over TLS
    #[serde(default)]
    pub secure: bool,
}

impl RelayEndpoint {
    /// Create an endpoint
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TunnelError::config("relay host cannot be empty"));
        }
        if self.port == 0 {
            return Err(TunnelError::config("relay port must be in 1..=65535"));
        }
        Ok(())
    }
}

/// Parameters of a consumer-side session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSessionRequest {
    /// Negotiated session/queue identifier
    pub queue_id: String,
    /// Relay broker both gateways use
    pub relay: RelayEndpoint,
    /// Public key of the provider-side gateway
    pub peer_public_key: String,
    /// Name of the consuming system
    pub consumer_name: String,
    /// Service definition being consumed
    pub service_definition: String,
}

/// Parameters of a provider-side session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSessionRequest {
    /// Negotiated session/queue identifier
    pub queue_id: String,
    /// Relay broker both gateways use
    pub relay: RelayEndpoint,
    /// Provider to connect to and the consumer gateway's key
    pub connection: ConnectionRequest,
}

struct SweeperTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tunnel sessions of one gateway
pub struct Gateway {
    config: Arc<GatewayConfig>,
    relay: Arc<dyn RelayClient>,
    tls: TlsContext,
    registry: Arc<SessionRegistry>,
    connections: DashMap<RelayEndpoint, RelayConnection>,
    sweeper: Mutex<Option<SweeperTask>>,
}

impl Gateway {
    /// Create a gateway; the port pool is seeded from `config.port_range`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        config: GatewayConfig,
        relay: Arc<dyn RelayClient>,
        tls: TlsContext,
    ) -> Result<Self> {
        config.validate().map_err(TunnelError::config)?;
        let registry = Arc::new(SessionRegistry::new(config.ports()));

        Ok(Self {
            config: Arc::new(config),
            relay,
            tls,
            registry,
            connections: DashMap::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// The gateway configuration
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Registries of this gateway
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open the consumer side of a session
    ///
    /// Returns the port the consumer connects to.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid parameters or a queue id already
    /// in use, and a gateway initialization error if the relay cannot be reached or
    /// the session cannot be set up.
    pub async fn connect_consumer(&self, request: ConsumerSessionRequest) -> Result<u16> {
        let peer_key = PeerPublicKey::parse(request.peer_public_key.as_str())?;
        request.relay.validate()?;
        self.ensure_unused(&request.queue_id)?;

        let connection = self.connection_for(&request.relay).await?;
        let worker = ConsumerSideWorker::new(
            self.context(connection),
            ConsumerSessionParams {
                queue_id: request.queue_id,
                peer_key,
                consumer_name: request.consumer_name,
                service_definition: request.service_definition,
            },
        )?;

        let port = worker.init().await?;
        if let Err(e) = worker.start() {
            worker.close(CloseReason::InitFailed).await;
            return Err(TunnelError::gateway_init(e.to_string()));
        }
        Ok(port)
    }

    /// Open the provider side of a session
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid request or a queue id already
    /// in use, and a gateway initialization error if the relay or the provider
    /// cannot be reached.
    pub async fn connect_provider(&self, request: ProviderSessionRequest) -> Result<()> {
        request.connection.validate()?;
        request.relay.validate()?;
        self.ensure_unused(&request.queue_id)?;

        let connection = self.connection_for(&request.relay).await?;
        let handler = ProviderSideHandler::new(
            self.context(connection),
            request.queue_id,
            request.connection,
        )?;
        handler.init().await
    }

    /// Close whichever side of session `queue_id` this gateway holds
    ///
    /// Returns `false` when the gateway holds no such session.
    pub async fn close_session(&self, queue_id: &str) -> bool {
        let mut found = false;
        if let Some(worker) = self.registry.get_consumer(queue_id) {
            worker.close(CloseReason::Requested).await;
            found = true;
        }
        if let Some(handler) = self.registry.get_provider(queue_id) {
            handler.close(CloseReason::Requested).await;
            found = true;
        }
        found
    }

    /// Start the idle sweeper; does nothing when it already runs
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the sweeper timing is invalid.
    pub fn start_sweeper(&self) -> Result<()> {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return Ok(());
        }

        let sweeper = ConnectionSweeper::new(
            Arc::clone(&self.registry),
            SweeperConfig::from_gateway(&self.config),
        )?;
        let shutdown = CancellationToken::new();
        let handle = Arc::new(sweeper).spawn(shutdown.clone());
        *slot = Some(SweeperTask { shutdown, handle });
        Ok(())
    }

    /// Stop the sweeper and close every session and relay connection
    pub async fn shutdown(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.shutdown.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "sweeper task failed");
            }
        }

        for worker in self.registry.consumers() {
            worker.close(CloseReason::Requested).await;
        }
        for handler in self.registry.providers() {
            handler.close(CloseReason::Requested).await;
            self.registry.remove_provider(handler.queue_id());
        }

        let connections: Vec<RelayConnection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for connection in connections {
            if !self.relay.is_connection_closed(&connection) {
                self.relay.close_connection(&connection).await;
            }
        }

        tracing::info!("gateway shut down");
    }

    fn ensure_unused(&self, queue_id: &str) -> Result<()> {
        if self.registry.get_session(queue_id).is_some()
            || self.registry.get_consumer(queue_id).is_some()
            || self.registry.get_provider(queue_id).is_some()
        {
            return Err(TunnelError::config(format!(
                "session {queue_id} already exists"
            )));
        }
        Ok(())
    }

    /// Reuse the open connection to `endpoint` or open a new one
    async fn connection_for(&self, endpoint: &RelayEndpoint) -> Result<RelayConnection> {
        let cached = self
            .connections
            .get(endpoint)
            .map(|entry| entry.value().clone());
        if let Some(connection) = cached.filter(|c| !self.relay.is_connection_closed(c)) {
            return Ok(connection);
        }

        let connection = self
            .relay
            .create_connection(&endpoint.host, endpoint.port, endpoint.secure)
            .await
            .map_err(|e| {
                TunnelError::gateway_init(format!(
                    "cannot reach relay {}:{}: {e}",
                    endpoint.host, endpoint.port
                ))
            })?;
        self.connections.insert(endpoint.clone(), connection.clone());
        Ok(connection)
    }

    fn context(&self, connection: RelayConnection) -> SessionContext {
        SessionContext {
            relay: Arc::clone(&self.relay),
            connection,
            registry: Arc::clone(&self.registry),
            tls: self.tls.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("consumers", &self.registry.consumer_count())
            .field("providers", &self.registry.provider_count())
            .field("relay_connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
