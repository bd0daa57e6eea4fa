//! Provider-side session handler and its socket rotation
//!
//! The handler receives the consumer's bytes from the relay and writes them to the
//! current provider socket. When the consumer speaks plain (non-chunked) HTTP, the
//! handler counts requests and, past `max_requests_per_socket`, opens a fresh
//! socket for the next request. The replaced socket is kept as `previous` so the
//! response still in flight on it reaches the consumer.
//!
//! ```text
//!            init                 close
//! Uninitialized --> Initialized ---------> Closed
//!                     |     ^
//!                     +-----+
//!                     rotate (counter > max, or current interrupted)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::worker::{ProviderLink, ProviderSideWorker};
use crate::http::{looks_like_chunked_http_request, looks_like_http_request_start, Answer};
use crate::relay::{ControlKind, RelayMessage, RelayMessageListener, SessionChannels, Side};
use crate::session::{
    ActiveSession, CloseReason, ConnectionRequest, PeerPublicKey, SessionContext,
};
use crate::{Result, TunnelError};

/// Lifecycle state of a provider-side handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    /// Created, nothing acquired
    Uninitialized,
    /// Relay channels open and a provider socket connected
    Initialized,
    /// Torn down
    Closed,
}

/// Provider sockets of a session; guarded by the rotation lock
#[derive(Default)]
struct Sockets {
    current: Option<Arc<ProviderSideWorker>>,
    previous: Option<Arc<ProviderSideWorker>>,
    next_generation: u32,
}

/// Provider side of one tunnel session
pub struct ProviderSideHandler {
    this: Weak<Self>,
    ctx: SessionContext,
    request: ConnectionRequest,
    queue_id: String,
    peer_key: PeerPublicKey,
    session: Arc<ActiveSession>,
    channels: Mutex<Option<SessionChannels>>,
    sockets: tokio::sync::Mutex<Sockets>,
    counting: OnceLock<bool>,
    request_count: AtomicU32,
    rotation_count: AtomicU32,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ProviderSideHandler {
    /// Create a handler; nothing is acquired until [`ProviderSideHandler::init`]
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the context or the connection request is
    /// invalid, the queue id is blank or the request limit is zero.
    pub fn new(
        ctx: SessionContext,
        queue_id: impl Into<String>,
        request: ConnectionRequest,
    ) -> Result<Arc<Self>> {
        ctx.validate()?;
        request.validate()?;
        if ctx.config.max_requests_per_socket == 0 {
            return Err(TunnelError::config("max requests per socket must be positive"));
        }
        let peer_key = request.consumer_gateway_key()?;
        let queue_id = queue_id.into();
        let session = Arc::new(ActiveSession::new(queue_id.clone(), peer_key.clone())?);

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ctx,
            request,
            queue_id,
            peer_key,
            session,
            channels: Mutex::new(None),
            sockets: tokio::sync::Mutex::new(Sockets::default()),
            counting: OnceLock::new(),
            request_count: AtomicU32::new(0),
            rotation_count: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Open the relay channels, connect the first provider socket and register
    ///
    /// # Errors
    ///
    /// Returns a gateway initialization error if the channels cannot be opened or
    /// the provider cannot be reached; the handler is closed in that case. Returns
    /// an invalid state error if the handler was initialized or closed before.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let mut sockets = self.sockets.lock().await;
        if self.is_closed() || self.initialized.load(Ordering::SeqCst) {
            return Err(TunnelError::invalid_state(format!(
                "provider side of {} cannot be initialized twice",
                self.queue_id
            )));
        }

        match self.acquire(&mut sockets).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!(
                    queue_id = %self.queue_id,
                    provider = %self.request.provider.system_name,
                    service = %self.request.service_definition,
                    "provider session initialized"
                );
                Ok(())
            }
            Err(e) => {
                drop(sockets);
                tracing::warn!(
                    queue_id = %self.queue_id,
                    error = %e,
                    "provider session init failed"
                );
                self.close(CloseReason::InitFailed).await;
                Err(TunnelError::gateway_init(format!(
                    "provider side of {}: {e}",
                    self.queue_id
                )))
            }
        }
    }

    async fn acquire(self: &Arc<Self>, sockets: &mut Sockets) -> Result<()> {
        let callback = Arc::clone(self) as Arc<dyn RelayMessageListener>;
        let channels = self
            .ctx
            .relay
            .open_session_channels(
                &self.ctx.connection,
                &self.queue_id,
                Side::Provider,
                callback,
            )
            .await?;
        *self.channels.lock() = Some(channels);

        let worker = self.connect_worker(sockets).await?;
        sockets.current = Some(worker);

        self.ctx.registry.insert_provider(Arc::clone(self));
        self.ctx.registry.insert_session(Arc::clone(&self.session));
        Ok(())
    }

    async fn connect_worker(&self, sockets: &mut Sockets) -> Result<Arc<ProviderSideWorker>> {
        let send_channel = self
            .channels
            .lock()
            .as_ref()
            .map(|c| c.send_data.clone())
            .ok_or_else(|| TunnelError::invalid_state("relay channels not open"))?;
        let link = ProviderLink {
            queue_id: self.queue_id.clone(),
            peer_key: self.peer_key.clone(),
            address: self.request.provider.address.clone(),
            port: self.request.provider.port,
            send_channel,
            session: Arc::clone(&self.session),
            owner: self.this.clone(),
        };

        let generation = sockets.next_generation;
        sockets.next_generation += 1;
        let worker = ProviderSideWorker::connect(&self.ctx, &link, generation).await?;
        if let Err(e) = worker.start() {
            worker.close().await;
            return Err(e);
        }
        Ok(worker)
    }

    /// Decode a data message, apply the rotation policy and write to the provider
    async fn forward(&self, message: &RelayMessage) -> Result<()> {
        let mut sockets = self.sockets.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        self.session.touch();
        let bytes = self
            .ctx
            .relay
            .get_bytes_from_message(message, &self.peer_key)?;

        let counting = *self.counting.get_or_init(|| {
            let enabled = looks_like_chunked_http_request(&bytes) == Answer::No
                && looks_like_http_request_start(&bytes) == Answer::Yes;
            tracing::debug!(
                queue_id = %self.queue_id,
                enabled = enabled,
                "request counting decided"
            );
            enabled
        });
        if counting && looks_like_http_request_start(&bytes) == Answer::Yes {
            self.request_count.fetch_add(1, Ordering::SeqCst);
        }

        let interrupted = sockets
            .current
            .as_ref()
            .map_or(true, |worker| worker.is_interrupted());
        let over_limit =
            self.request_count.load(Ordering::SeqCst) > self.ctx.config.max_requests_per_socket;
        if interrupted || over_limit {
            self.rotate(&mut sockets, interrupted).await?;
        }

        let current = sockets
            .current
            .as_ref()
            .ok_or_else(|| TunnelError::invalid_state("no provider socket to write to"))?;
        current.write(&bytes).await
    }

    async fn rotate(&self, sockets: &mut Sockets, interrupted: bool) -> Result<()> {
        if interrupted {
            if let Some(dead) = sockets.current.take() {
                dead.close().await;
            }
        } else {
            if let Some(stale) = sockets.previous.take() {
                stale.interrupt();
                stale.close().await;
            }
            sockets.previous = sockets.current.take();
        }

        let fresh = self.connect_worker(sockets).await?;
        let generation = fresh.generation();
        sockets.current = Some(fresh);
        self.request_count.store(1, Ordering::SeqCst);
        self.rotation_count.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            queue_id = %self.queue_id,
            generation = generation,
            interrupted = interrupted,
            "provider socket rotated"
        );

        let channels = self.channels.lock().clone();
        if let Some(channels) = channels {
            if let Err(e) = self
                .ctx
                .relay
                .send_switch_control_message(
                    &self.ctx.connection,
                    &channels.send_control,
                    &self.queue_id,
                )
                .await
            {
                tracing::debug!(
                    queue_id = %self.queue_id,
                    error = %e,
                    "switch notification not sent"
                );
            }
        }
        Ok(())
    }

    /// Tear the session down; later calls do nothing
    ///
    /// Every step runs even when an earlier one fails. The handler leaves the
    /// handler registry only once the relay connection could be closed.
    pub async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let relay = &self.ctx.relay;
        let connection = &self.ctx.connection;

        self.ctx.registry.remove_session(&self.queue_id);

        let (previous, current) = {
            let mut sockets = self.sockets.lock().await;
            (sockets.previous.take(), sockets.current.take())
        };
        for worker in [previous, current].into_iter().flatten() {
            worker.interrupt();
            worker.close().await;
        }

        let channels = self.channels.lock().clone();
        if let Some(channels) = channels.filter(|_| reason.notifies_peer()) {
            if let Err(e) = relay
                .send_close_control_message(connection, &channels.send_control, &self.queue_id)
                .await
            {
                tracing::warn!(
                    queue_id = %self.queue_id,
                    error = %e,
                    "failed to notify consumer side of close"
                );
            }
        }

        if let Err(e) = relay.unsubscribe_from_queues(connection, &self.queue_id).await {
            tracing::warn!(
                queue_id = %self.queue_id,
                error = %e,
                "failed to unsubscribe provider queues"
            );
        }
        match relay.destroy_queues(connection, &self.queue_id).await {
            Ok(true) => {
                relay.close_connection(connection).await;
                self.ctx.registry.remove_provider(&self.queue_id);
            }
            Ok(false) => {
                tracing::debug!(queue_id = %self.queue_id, "relay connection still shared");
            }
            Err(e) => {
                tracing::warn!(
                    queue_id = %self.queue_id,
                    error = %e,
                    "failed to destroy provider queues"
                );
            }
        }

        tracing::info!(
            queue_id = %self.queue_id,
            reason = %reason,
            rotations = self.rotation_count(),
            "provider session closed"
        );
    }

    async fn handle_control(&self, message: &RelayMessage) {
        let relay = &self.ctx.relay;
        match relay.control_kind(message) {
            Ok(ControlKind::Close) => {
                match relay.handle_close_control_message(message, &self.ctx.connection) {
                    Ok(()) => self.close(CloseReason::PeerClosed).await,
                    Err(e) => {
                        tracing::warn!(
                            queue_id = %self.queue_id,
                            error = %e,
                            "invalid close control message"
                        );
                        self.close(CloseReason::ProtocolError).await;
                    }
                }
            }
            Ok(ControlKind::Switch) => {
                tracing::debug!(queue_id = %self.queue_id, "ignoring switch from consumer side");
            }
            Err(e) => {
                tracing::warn!(queue_id = %self.queue_id, error = %e, "unexpected control message");
                self.close(CloseReason::ProtocolError).await;
            }
        }
    }

    /// Session/queue identifier
    #[must_use]
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// The connection request the handler was built from
    #[must_use]
    pub fn request(&self) -> &ConnectionRequest {
        &self.request
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> HandlerState {
        if self.is_closed() {
            HandlerState::Closed
        } else if self.initialized.load(Ordering::SeqCst) {
            HandlerState::Initialized
        } else {
            HandlerState::Uninitialized
        }
    }

    /// Requests counted on the current provider socket
    #[must_use]
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Whether request counting is on; `None` before the first data message
    #[must_use]
    pub fn counting_enabled(&self) -> Option<bool> {
        self.counting.get().copied()
    }

    /// Number of socket rotations so far
    #[must_use]
    pub fn rotation_count(&self) -> u32 {
        self.rotation_count.load(Ordering::SeqCst)
    }

    /// Last time a byte moved in either direction
    #[must_use]
    pub fn last_interaction(&self) -> Instant {
        self.session.last_interaction()
    }

    /// The session record
    #[must_use]
    pub fn session(&self) -> &Arc<ActiveSession> {
        &self.session
    }

    /// Whether the session was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayMessageListener for ProviderSideHandler {
    async fn on_message(&self, message: RelayMessage) {
        if self.is_closed() {
            tracing::debug!(
                queue_id = %self.queue_id,
                channel = %message.channel(),
                "message for closed provider session dropped"
            );
            return;
        }

        if self.ctx.relay.is_control_message(&message) {
            self.handle_control(&message).await;
            return;
        }

        if let Err(e) = self.forward(&message).await {
            if e.is_protocol() {
                tracing::warn!(
                    queue_id = %self.queue_id,
                    error = %e,
                    "protocol violation on provider side"
                );
            } else {
                tracing::warn!(
                    queue_id = %self.queue_id,
                    error = %e,
                    "failed to deliver bytes to provider"
                );
            }
            self.close(CloseReason::from_error(&e)).await;
        }
    }
}

impl fmt::Debug for ProviderSideHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSideHandler")
            .field("queue_id", &self.queue_id)
            .field("state", &self.state())
            .field("request_count", &self.request_count())
            .field("rotation_count", &self.rotation_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use crate::test_support::{connection_request as request, free_port, session_context};

    async fn context(relay: &Arc<MemoryRelay>) -> SessionContext {
        session_context(relay, 9000..=9001).await
    }

    #[tokio::test]
    async fn test_new_validates_request() {
        let relay = Arc::new(MemoryRelay::new());
        let ctx = context(&relay).await;

        let mut bad = request(8443);
        bad.consumer_gateway_public_key = "%%%".to_string();
        assert!(matches!(
            ProviderSideHandler::new(ctx.clone(), "q-1", bad),
            Err(TunnelError::Config { .. })
        ));
        assert!(matches!(
            ProviderSideHandler::new(ctx.clone(), " ", request(8443)),
            Err(TunnelError::Config { .. })
        ));

        let handler = ProviderSideHandler::new(ctx, "q-1", request(8443)).unwrap();
        assert_eq!(handler.state(), HandlerState::Uninitialized);
        assert_eq!(handler.counting_enabled(), None);
    }

    #[tokio::test]
    async fn test_init_failure_is_gateway_init_and_rolls_back() {
        let relay = Arc::new(MemoryRelay::new());
        let ctx = context(&relay).await;
        let registry = Arc::clone(&ctx.registry);

        let handler = ProviderSideHandler::new(ctx, "q-1", request(free_port())).unwrap();
        let err = handler.init().await.unwrap_err();
        assert!(matches!(err, TunnelError::GatewayInit { .. }));
        assert_eq!(handler.state(), HandlerState::Closed);
        assert_eq!(registry.provider_count(), 0);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(relay.session_count(), 0);
        assert!(!relay.is_subscribed("REQ-q-1"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let relay = Arc::new(MemoryRelay::new());
        let ctx = context(&relay).await;
        let handler = ProviderSideHandler::new(ctx, "q-1", request(8443)).unwrap();

        handler.close(CloseReason::Requested).await;
        assert_eq!(handler.state(), HandlerState::Closed);
        handler.close(CloseReason::Requested).await;
        assert_eq!(handler.state(), HandlerState::Closed);

        // Messages after close are dropped without effect.
        handler
            .on_message(RelayMessage::new("REQ-q-1", &b"GET / HTTP/1.1\r\n"[..]))
            .await;
        assert_eq!(handler.request_count(), 0);
        assert_eq!(handler.counting_enabled(), None);
    }
}
