//! Consumer-side socket worker
//!
//! A [`ConsumerSideWorker`] owns one tunnel session on the consumer's gateway. It
//! leases a port, listens for exactly one TLS connection from the consumer and pumps
//! the consumer's bytes into the relay. Bytes coming back from the provider side are
//! delivered through [`RelayMessageListener::on_message`] and written to the
//! accepted socket.
//!
//! ```text
//! consumer --TLS--> [listener:port] --read--> REQ-<queue_id>  --> provider side
//! consumer <--TLS-- [accepted socket] <-write- RESP-<queue_id> <-- provider side
//! ```

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;

use crate::registry::PortLease;
use crate::relay::{ControlKind, RelayMessage, RelayMessageListener, SessionChannels, Side};
use crate::session::{ActiveSession, CloseReason, PeerPublicKey, SessionContext};
use crate::{Result, TunnelError};

type ConsumerWriter = WriteHalf<TlsStream<TcpStream>>;

/// Identity of a consumer-side session
#[derive(Debug, Clone)]
pub struct ConsumerSessionParams {
    /// Session/queue identifier negotiated with the provider side
    pub queue_id: String,
    /// Public key of the provider-side gateway
    pub peer_key: PeerPublicKey,
    /// Name of the consuming system
    pub consumer_name: String,
    /// Service definition being consumed
    pub service_definition: String,
}

/// Consumer side of one tunnel session
pub struct ConsumerSideWorker {
    ctx: SessionContext,
    params: ConsumerSessionParams,
    session: Arc<ActiveSession>,
    channels: Mutex<Option<SessionChannels>>,
    lease: Mutex<Option<PortLease>>,
    listener: Mutex<Option<TcpListener>>,
    writer: tokio::sync::Mutex<Option<ConsumerWriter>>,
    interrupt: CancellationToken,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ConsumerSideWorker {
    /// Create a worker; nothing is acquired until [`ConsumerSideWorker::init`]
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - the relay connection is already closed
    /// - the read timeout or chunk size is zero
    /// - the queue id, consumer name or service definition is blank
    pub fn new(ctx: SessionContext, params: ConsumerSessionParams) -> Result<Arc<Self>> {
        ctx.validate()?;
        if params.consumer_name.trim().is_empty() {
            return Err(TunnelError::config("consumer name cannot be empty"));
        }
        if params.service_definition.trim().is_empty() {
            return Err(TunnelError::config("service definition cannot be empty"));
        }
        let session = Arc::new(ActiveSession::new(
            params.queue_id.clone(),
            params.peer_key.clone(),
        )?);

        Ok(Arc::new(Self {
            ctx,
            params,
            session,
            channels: Mutex::new(None),
            lease: Mutex::new(None),
            listener: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            interrupt: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Lease a port, bind the TLS listener, open the relay channels and register
    ///
    /// Returns the port consumers connect to. On failure every partial step is
    /// rolled back and the worker is closed.
    ///
    /// # Errors
    ///
    /// Returns a gateway initialization error if no port is free, the bind fails or
    /// the relay channels cannot be opened. Returns an invalid state error if the
    /// worker was initialized or closed before.
    pub async fn init(self: &Arc<Self>) -> Result<u16> {
        if self.is_closed() || self.initialized.load(Ordering::SeqCst) {
            return Err(TunnelError::invalid_state(format!(
                "consumer side of {} cannot be initialized twice",
                self.queue_id()
            )));
        }

        match self.acquire().await {
            Ok(port) => {
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!(
                    queue_id = %self.queue_id(),
                    port = port,
                    consumer = %self.params.consumer_name,
                    service = %self.params.service_definition,
                    "consumer session initialized"
                );
                Ok(port)
            }
            Err(e) => {
                tracing::warn!(
                    queue_id = %self.queue_id(),
                    error = %e,
                    "consumer session init failed"
                );
                self.close(CloseReason::InitFailed).await;
                Err(TunnelError::gateway_init(format!(
                    "consumer side of {}: {e}",
                    self.queue_id()
                )))
            }
        }
    }

    async fn acquire(self: &Arc<Self>) -> Result<u16> {
        let lease = self
            .ctx
            .registry
            .ports()
            .lease()
            .ok_or_else(|| TunnelError::gateway_init("no free port in the pool"))?;
        let port = lease.port();
        *self.lease.lock() = Some(lease);

        let ip: IpAddr = self.ctx.config.bind_address.parse().map_err(|_| {
            TunnelError::config(format!(
                "bind address {} is not an IP address",
                self.ctx.config.bind_address
            ))
        })?;
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        *self.listener.lock() = Some(listener);

        let callback = Arc::clone(self) as Arc<dyn RelayMessageListener>;
        let channels = self
            .ctx
            .relay
            .open_session_channels(
                &self.ctx.connection,
                self.queue_id(),
                Side::Consumer,
                callback,
            )
            .await?;
        *self.channels.lock() = Some(channels);

        self.ctx.registry.insert_consumer(Arc::clone(self));
        self.ctx.registry.insert_session(Arc::clone(&self.session));
        Ok(port)
    }

    /// Spawn the pump task: accept one consumer, handshake, forward its bytes
    ///
    /// The task closes the session when the socket ends, fails, times out or the
    /// worker is interrupted.
    ///
    /// # Errors
    ///
    /// Returns an invalid state error if the worker is not initialized or was
    /// already started.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            TunnelError::invalid_state(format!(
                "consumer side of {} is not initialized or already started",
                self.queue_id()
            ))
        })?;

        let worker = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let reason = match worker.pump(listener).await {
                Ok(reason) => reason,
                Err(e) => {
                    if e.is_protocol() {
                        tracing::warn!(
                            queue_id = %worker.queue_id(),
                            error = %e,
                            "protocol violation on consumer side"
                        );
                    } else {
                        tracing::warn!(
                            queue_id = %worker.queue_id(),
                            error = %e,
                            "consumer side transport failure"
                        );
                    }
                    CloseReason::from_error(&e)
                }
            };
            worker.close(reason).await;
        }))
    }

    async fn pump(&self, listener: TcpListener) -> Result<CloseReason> {
        let limit = self.ctx.config.socket_read_timeout;

        let Some(accepted) = self.guarded(limit, listener.accept()).await? else {
            return Ok(CloseReason::Interrupted);
        };
        let (stream, peer_addr) = accepted?;
        // Exactly one consumer connection per session
        drop(listener);

        let Some(handshake) = self
            .guarded(limit, self.ctx.tls.acceptor().accept(stream))
            .await?
        else {
            return Ok(CloseReason::Interrupted);
        };
        let (mut reader, writer) = tokio::io::split(handshake?);
        *self.writer.lock().await = Some(writer);
        self.session.touch();

        tracing::debug!(
            queue_id = %self.queue_id(),
            peer = %peer_addr,
            "consumer connection accepted"
        );

        let channels = self
            .channels
            .lock()
            .clone()
            .ok_or_else(|| TunnelError::invalid_state("relay channels not open"))?;
        let mut buf = vec![0u8; self.ctx.config.max_chunk_size];

        loop {
            let Some(read) = self.guarded(limit, reader.read(&mut buf)).await? else {
                return Ok(CloseReason::Interrupted);
            };
            let n = read?;
            if n == 0 {
                return Ok(CloseReason::SocketClosed);
            }
            self.session.touch();
            self.ctx
                .relay
                .send_bytes(
                    &self.ctx.connection,
                    &channels.send_data,
                    &self.params.peer_key,
                    &buf[..n],
                )
                .await?;
        }
    }

    /// Run `fut` bounded by `limit`; `None` when the worker is interrupted first
    async fn guarded<F: Future>(&self, limit: Duration, fut: F) -> Result<Option<F::Output>> {
        tokio::select! {
            biased;

            () = self.interrupt.cancelled() => Ok(None),
            result = tokio::time::timeout(limit, fut) => {
                result.map(Some).map_err(|_| TunnelError::timeout())
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let limit = self.ctx.config.socket_read_timeout;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TunnelError::invalid_state(format!(
                "write to consumer side of {} before its connection was accepted",
                self.queue_id()
            )));
        };

        tokio::time::timeout(limit, writer.write_all(bytes))
            .await
            .map_err(|_| TunnelError::timeout())??;
        tokio::time::timeout(limit, writer.flush())
            .await
            .map_err(|_| TunnelError::timeout())??;
        self.session.touch();
        Ok(())
    }

    /// Ask the pump to stop; it closes the session on its next step
    pub fn interrupt(&self) {
        if !self.interrupt.is_cancelled() {
            tracing::debug!(queue_id = %self.queue_id(), "consumer side interrupted");
            self.interrupt.cancel();
        }
    }

    /// Tear the session down; later calls do nothing
    ///
    /// Every step runs even when an earlier one fails.
    pub async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.interrupt.cancel();
        let queue_id = self.queue_id();
        let relay = &self.ctx.relay;
        let connection = &self.ctx.connection;

        self.ctx.registry.remove_consumer(queue_id);
        self.ctx.registry.remove_session(queue_id);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let limit = self.ctx.config.socket_read_timeout;
            if let Ok(Err(e)) = tokio::time::timeout(limit, writer.shutdown()).await {
                tracing::debug!(
                    queue_id = %queue_id,
                    error = %e,
                    "consumer socket shutdown failed"
                );
            }
        }

        drop(self.listener.lock().take());

        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            lease.release();
        }

        let channels = self.channels.lock().clone();
        if let Some(channels) = channels.filter(|_| reason.notifies_peer()) {
            if let Err(e) = relay
                .send_close_control_message(connection, &channels.send_control, queue_id)
                .await
            {
                tracing::warn!(
                    queue_id = %queue_id,
                    error = %e,
                    "failed to notify provider side of close"
                );
            }
        }

        if let Err(e) = relay.unsubscribe_from_queues(connection, queue_id).await {
            tracing::warn!(
                queue_id = %queue_id,
                error = %e,
                "failed to unsubscribe consumer queues"
            );
        }
        match relay.destroy_queues(connection, queue_id).await {
            Ok(true) => relay.close_connection(connection).await,
            Ok(false) => {
                tracing::debug!(queue_id = %queue_id, "relay connection still shared");
            }
            Err(e) => {
                tracing::warn!(
                    queue_id = %queue_id,
                    error = %e,
                    "failed to destroy consumer queues"
                );
            }
        }

        tracing::info!(queue_id = %queue_id, reason = %reason, "consumer session closed");
    }

    /// Session/queue identifier
    #[must_use]
    pub fn queue_id(&self) -> &str {
        &self.params.queue_id
    }

    /// Port leased for the listener, while held
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.lease.lock().as_ref().map(PortLease::port)
    }

    /// The session record
    #[must_use]
    pub fn session(&self) -> &Arc<ActiveSession> {
        &self.session
    }

    /// Last time a byte moved in either direction
    #[must_use]
    pub fn last_interaction(&self) -> Instant {
        self.session.last_interaction()
    }

    /// Whether [`ConsumerSideWorker::init`] succeeded
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether the worker was interrupted
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Whether the session was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn handle_control(&self, message: &RelayMessage) {
        let relay = &self.ctx.relay;
        match relay.control_kind(message) {
            Ok(ControlKind::Close) => {
                match relay.handle_close_control_message(message, &self.ctx.connection) {
                    Ok(()) => self.close(CloseReason::PeerClosed).await,
                    Err(e) => {
                        tracing::warn!(
                            queue_id = %self.queue_id(),
                            error = %e,
                            "invalid close control message"
                        );
                        self.close(CloseReason::ProtocolError).await;
                    }
                }
            }
            Ok(ControlKind::Switch) => {
                tracing::debug!(queue_id = %self.queue_id(), "provider side switched sockets");
            }
            Err(e) => {
                tracing::warn!(
                    queue_id = %self.queue_id(),
                    error = %e,
                    "unexpected control message"
                );
                self.close(CloseReason::ProtocolError).await;
            }
        }
    }
}

#[async_trait]
impl RelayMessageListener for ConsumerSideWorker {
    async fn on_message(&self, message: RelayMessage) {
        if self.is_closed() {
            tracing::debug!(
                queue_id = %self.queue_id(),
                channel = %message.channel(),
                "message for closed consumer session dropped"
            );
            return;
        }

        if self.ctx.relay.is_control_message(&message) {
            self.handle_control(&message).await;
            return;
        }

        let delivered = match self
            .ctx
            .relay
            .get_bytes_from_message(&message, &self.params.peer_key)
        {
            Ok(bytes) => self.write(&bytes).await,
            Err(e) => Err(e),
        };

        if let Err(e) = delivered {
            if self.is_closed() {
                return;
            }
            match &e {
                TunnelError::InvalidState { .. } => {
                    tracing::error!(
                        queue_id = %self.queue_id(),
                        error = %e,
                        "consumer write out of order"
                    );
                }
                TunnelError::Protocol { .. } => {
                    tracing::warn!(
                        queue_id = %self.queue_id(),
                        error = %e,
                        "protocol violation on consumer side"
                    );
                }
                _ => {
                    tracing::warn!(
                        queue_id = %self.queue_id(),
                        error = %e,
                        "failed to deliver bytes to consumer"
                    );
                }
            }
            self.close(CloseReason::from_error(&e)).await;
        }
    }
}

impl fmt::Debug for ConsumerSideWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSideWorker")
            .field("queue_id", &self.params.queue_id)
            .field("port", &self.port())
            .field("initialized", &self.is_initialized())
            .field("interrupted", &self.is_interrupted())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MemoryRelay, RelayClient};
    use crate::test_support::{consumer_params as params, free_port, session_context as context};

    #[tokio::test]
    async fn test_new_rejects_bad_arguments() {
        let relay = Arc::new(MemoryRelay::new());
        let ctx = context(&relay, 9000..=9000).await;

        let mut bad = params("q-1");
        bad.consumer_name = " ".to_string();
        assert!(matches!(
            ConsumerSideWorker::new(ctx.clone(), bad),
            Err(TunnelError::Config { .. })
        ));

        assert!(matches!(
            ConsumerSideWorker::new(ctx.clone(), params("")),
            Err(TunnelError::Config { .. })
        ));

        relay.close_connection(&ctx.connection).await;
        assert!(matches!(
            ConsumerSideWorker::new(ctx, params("q-1")),
            Err(TunnelError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_registers_and_close_releases() {
        let relay = Arc::new(MemoryRelay::new());
        let port = free_port();
        let ctx = context(&relay, port..=port).await;
        let registry = Arc::clone(&ctx.registry);

        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        assert_eq!(worker.init().await.unwrap(), port);
        assert!(worker.is_initialized());
        assert_eq!(worker.port(), Some(port));
        assert_eq!(registry.consumer_count(), 1);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.ports().available(), 0);
        assert!(relay.is_subscribed("RESP-q-1"));

        worker.close(CloseReason::Requested).await;
        assert!(worker.is_closed());
        assert_eq!(worker.port(), None);
        assert_eq!(registry.consumer_count(), 0);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.ports().contains(port));
        assert!(!relay.is_subscribed("RESP-q-1"));

        // Second close leaves the pool untouched.
        worker.close(CloseReason::Requested).await;
        assert_eq!(registry.ports().available(), 1);
        assert!(worker.init().await.is_err());
    }

    #[tokio::test]
    async fn test_init_failure_rolls_back() {
        let relay = Arc::new(MemoryRelay::new());
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let ctx = context(&relay, port..=port).await;
        let registry = Arc::clone(&ctx.registry);

        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        let err = worker.init().await.unwrap_err();
        assert!(matches!(err, TunnelError::GatewayInit { .. }));
        assert!(worker.is_closed());
        assert!(registry.ports().contains(port));
        assert_eq!(registry.consumer_count(), 0);
        assert_eq!(relay.session_count(), 0);
    }

    #[tokio::test]
    async fn test_init_fails_without_free_port() {
        let relay = Arc::new(MemoryRelay::new());
        let port = free_port();
        let ctx = context(&relay, port..=port).await;

        let first = ConsumerSideWorker::new(ctx.clone(), params("q-1")).unwrap();
        first.init().await.unwrap();

        let second = ConsumerSideWorker::new(ctx, params("q-2")).unwrap();
        assert!(matches!(
            second.init().await,
            Err(TunnelError::GatewayInit { .. })
        ));
        assert!(!first.is_closed());
        first.close(CloseReason::Requested).await;
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let relay = Arc::new(MemoryRelay::new());
        let ctx = context(&relay, 9000..=9000).await;
        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        assert!(matches!(
            worker.start(),
            Err(TunnelError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_data_before_accept_closes_session() {
        let relay = Arc::new(MemoryRelay::new());
        let port = free_port();
        let ctx = context(&relay, port..=port).await;
        let registry = Arc::clone(&ctx.registry);

        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        worker.init().await.unwrap();

        worker
            .on_message(RelayMessage::new("RESP-q-1", &b"HTTP/1.1 200 OK\r\n"[..]))
            .await;
        assert!(worker.is_closed());
        assert_eq!(registry.consumer_count(), 0);
        assert!(registry.ports().contains(port));
    }

    #[tokio::test]
    async fn test_interrupt_stops_waiting_accept() {
        let relay = Arc::new(MemoryRelay::new());
        let port = free_port();
        let ctx = context(&relay, port..=port).await;
        let registry = Arc::clone(&ctx.registry);

        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        worker.init().await.unwrap();
        let pump = worker.start().unwrap();

        worker.interrupt();
        tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(worker.is_closed());
        assert!(registry.ports().contains(port));
        assert_eq!(relay.session_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_control_is_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let port = free_port();
        let ctx = context(&relay, port..=port).await;

        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        worker.init().await.unwrap();
        worker
            .on_message(RelayMessage::new("RESP-q-1-CONTROL", "SWITCH q-1"))
            .await;
        assert!(!worker.is_closed());

        worker
            .on_message(RelayMessage::new("RESP-q-1-CONTROL", "CLOSE q-1"))
            .await;
        assert!(worker.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_control_is_protocol_error() {
        let relay = Arc::new(MemoryRelay::new());
        let port = free_port();
        let ctx = context(&relay, port..=port).await;

        let worker = ConsumerSideWorker::new(ctx, params("q-1")).unwrap();
        worker.init().await.unwrap();
        worker
            .on_message(RelayMessage::new("RESP-q-1-CONTROL", "RESET q-1"))
            .await;
        assert!(worker.is_closed());
    }
}
