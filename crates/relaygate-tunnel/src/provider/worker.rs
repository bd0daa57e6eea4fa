//! Outbound TLS socket to the provider

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

use super::ProviderSideHandler;
use crate::session::{ActiveSession, CloseReason, PeerPublicKey, SessionContext};
use crate::{Result, TunnelError};

type ProviderReader = ReadHalf<TlsStream<TcpStream>>;
type ProviderWriter = WriteHalf<TlsStream<TcpStream>>;

/// Where a provider-side session connects and where it sends what it reads
#[derive(Debug, Clone)]
pub struct ProviderLink {
    /// Session/queue identifier
    pub queue_id: String,
    /// Public key of the consumer-side gateway
    pub peer_key: PeerPublicKey,
    /// Provider host name or IP address, also the TLS server name
    pub address: String,
    /// Provider TLS port
    pub port: u16,
    /// Relay data channel towards the consumer side
    pub send_channel: String,
    /// Session record refreshed on every transfer
    pub session: Arc<ActiveSession>,
    /// Handler closed when the relay rejects bytes read from the provider
    pub owner: Weak<ProviderSideHandler>,
}

/// One outbound TLS connection of a provider-side session
///
/// Exclusively owned by a [`super::ProviderSideHandler`], which replaces it on
/// rotation.
pub struct ProviderSideWorker {
    ctx: SessionContext,
    link: ProviderLink,
    generation: u32,
    reader: Mutex<Option<ProviderReader>>,
    writer: tokio::sync::Mutex<Option<ProviderWriter>>,
    interrupt: CancellationToken,
    closed: AtomicBool,
}

impl ProviderSideWorker {
    /// Connect to the provider and complete the TLS handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails or times out, or if
    /// the provider address is not a valid server name.
    pub async fn connect(
        ctx: &SessionContext,
        link: &ProviderLink,
        generation: u32,
    ) -> Result<Arc<Self>> {
        let server_name = ServerName::try_from(link.address.clone()).map_err(|e| {
            TunnelError::tls(format!("invalid provider server name {}: {e}", link.address))
        })?;

        let stream = tokio::time::timeout(
            ctx.config.provider_connect_timeout,
            TcpStream::connect((link.address.as_str(), link.port)),
        )
        .await
        .map_err(|_| TunnelError::timeout())??;

        let tls = tokio::time::timeout(
            ctx.config.socket_read_timeout,
            ctx.tls.connector().connect(server_name, stream),
        )
        .await
        .map_err(|_| TunnelError::timeout())??;

        let (reader, writer) = tokio::io::split(tls);
        link.session.touch();

        tracing::debug!(
            queue_id = %link.queue_id,
            provider = %format!("{}:{}", link.address, link.port),
            generation = generation,
            "connected to provider"
        );

        Ok(Arc::new(Self {
            ctx: ctx.clone(),
            link: link.clone(),
            generation,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            interrupt: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Spawn the pump task forwarding provider bytes to the consumer side
    ///
    /// End of stream, a socket failure or a timeout marks the worker interrupted;
    /// the owning handler replaces it on the next message. A relay failure closes
    /// the whole session.
    ///
    /// # Errors
    ///
    /// Returns an invalid state error if the worker was already started.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let reader = self.reader.lock().take().ok_or_else(|| {
            TunnelError::invalid_state(format!(
                "provider socket {} of {} already started",
                self.generation, self.link.queue_id
            ))
        })?;

        let worker = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let queue_id = &worker.link.queue_id;
            match worker.pump(reader).await {
                Ok(()) => {
                    tracing::debug!(
                        queue_id = %queue_id,
                        generation = worker.generation,
                        "provider socket finished"
                    );
                }
                Err(e) if e.is_relay() => {
                    tracing::warn!(
                        queue_id = %queue_id,
                        generation = worker.generation,
                        error = %e,
                        "relay rejected provider bytes"
                    );
                    worker.interrupt();
                    if let Some(handler) = worker.link.owner.upgrade() {
                        handler.close(CloseReason::TransportError).await;
                    }
                    return;
                }
                Err(e) if e.is_protocol() => {
                    tracing::warn!(
                        queue_id = %queue_id,
                        generation = worker.generation,
                        error = %e,
                        "protocol violation on provider socket"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        queue_id = %queue_id,
                        generation = worker.generation,
                        error = %e,
                        "provider socket failure"
                    );
                }
            }
            worker.interrupt();
        }))
    }

    async fn pump(&self, mut reader: ProviderReader) -> Result<()> {
        let limit = self.ctx.config.socket_read_timeout;
        let mut buf = vec![0u8; self.ctx.config.max_chunk_size];

        loop {
            let Some(read) = self.guarded(limit, reader.read(&mut buf)).await? else {
                return Ok(());
            };
            let n = read?;
            if n == 0 {
                return Ok(());
            }
            self.link.session.touch();
            self.ctx
                .relay
                .send_bytes(
                    &self.ctx.connection,
                    &self.link.send_channel,
                    &self.link.peer_key,
                    &buf[..n],
                )
                .await?;
        }
    }

    async fn guarded<F: Future>(&self, limit: Duration, fut: F) -> Result<Option<F::Output>> {
        tokio::select! {
            biased;

            () = self.interrupt.cancelled() => Ok(None),
            result = tokio::time::timeout(limit, fut) => {
                result.map(Some).map_err(|_| TunnelError::timeout())
            }
        }
    }

    /// Deliver consumer bytes to the provider
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is closed or the write fails or times out.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let limit = self.ctx.config.socket_read_timeout;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TunnelError::invalid_state(format!(
                "provider socket {} of {} is closed",
                self.generation, self.link.queue_id
            )));
        };

        tokio::time::timeout(limit, writer.write_all(bytes))
            .await
            .map_err(|_| TunnelError::timeout())??;
        tokio::time::timeout(limit, writer.flush())
            .await
            .map_err(|_| TunnelError::timeout())??;
        self.link.session.touch();
        Ok(())
    }

    /// Stop the pump
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Whether the pump stopped or was asked to stop
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Close the outbound socket; later calls do nothing
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.interrupt.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let limit = self.ctx.config.socket_read_timeout;
            if let Ok(Err(e)) = tokio::time::timeout(limit, writer.shutdown()).await {
                tracing::debug!(
                    queue_id = %self.link.queue_id,
                    error = %e,
                    "provider socket shutdown failed"
                );
            }
        }
        drop(self.reader.lock().take());

        tracing::debug!(
            queue_id = %self.link.queue_id,
            generation = self.generation,
            "provider socket closed"
        );
    }

    /// Whether the socket was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Position of this socket in the session's rotation sequence, from 0
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ProviderSideWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSideWorker")
            .field("queue_id", &self.link.queue_id)
            .field("generation", &self.generation)
            .field("interrupted", &self.is_interrupted())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
