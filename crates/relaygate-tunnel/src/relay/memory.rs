//! In-process relay broker
//!
//! [`MemoryRelay`] implements [`RelayClient`] without a network hop, for gateways
//! that run both sides in one process and for tests. Payloads travel in clear.
//!
//! Each subscribed session side gets one dispatcher task that hands messages from
//! its data and control channels to the listener strictly one at a time. Messages
//! sent to a channel nobody listens on yet are kept and flushed on subscription.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    is_control_channel, queue_id_of, ControlKind, RelayClient, RelayConnection, RelayMessage,
    RelayMessageListener, SessionChannels, Side,
};
use crate::session::PeerPublicKey;
use crate::{Result, TunnelError};

/// Routing state; one lock so subscription and backlog flushing cannot interleave
/// with delivery
#[derive(Default)]
struct Routes {
    /// Receive channel name -> the dispatcher queue of the subscribed session side
    subscribers: HashMap<String, mpsc::UnboundedSender<RelayMessage>>,
    /// Messages sent to channels without a subscriber yet
    backlog: HashMap<String, Vec<RelayMessage>>,
}

/// A session side whose channels were opened on a connection
struct SessionEntry {
    connection: Uuid,
    channels: SessionChannels,
}

/// In-process implementation of [`RelayClient`]
#[derive(Default)]
pub struct MemoryRelay {
    /// Connection id -> closed flag
    connections: DashMap<Uuid, bool>,
    /// Open session sides
    sessions: DashMap<(String, Side), SessionEntry>,
    routes: Mutex<Routes>,
    /// Channels whose sends fail on purpose
    failing: DashSet<String>,
}

impl MemoryRelay {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `channel` fail with a relay error
    pub fn fail_sends_on(&self, channel: impl Into<String>) {
        self.failing.insert(channel.into());
    }

    /// Undo [`MemoryRelay::fail_sends_on`]
    pub fn restore_sends_on(&self, channel: &str) {
        self.failing.remove(channel);
    }

    /// Get the number of open connections
    #[must_use]
    pub fn open_connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !*entry.value())
            .count()
    }

    /// Get the number of session sides with open channels
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a listener currently receives from `channel`
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.routes.lock().subscribers.contains_key(channel)
    }

    /// Get the number of messages waiting for a subscriber on `channel`
    #[must_use]
    pub fn pending(&self, channel: &str) -> usize {
        self.routes.lock().backlog.get(channel).map_or(0, Vec::len)
    }

    fn ensure_open(&self, connection: &RelayConnection) -> Result<()> {
        if self.is_connection_closed(connection) {
            return Err(TunnelError::relay(format!(
                "relay connection {} is closed",
                connection.id()
            )));
        }
        Ok(())
    }

    fn ensure_sendable(&self, connection: &RelayConnection, channel: &str) -> Result<()> {
        self.ensure_open(connection)?;
        if self.failing.contains(channel) {
            return Err(TunnelError::relay(format!("send to {channel} failed")));
        }
        Ok(())
    }

    fn deliver(&self, message: RelayMessage) {
        let mut routes = self.routes.lock();
        match routes.subscribers.get(message.channel()) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::debug!("dropping relay message for finished dispatcher");
                }
            }
            None => routes
                .backlog
                .entry(message.channel().to_string())
                .or_default()
                .push(message),
        }
    }

    fn unroute(&self, channels: &SessionChannels) {
        let mut routes = self.routes.lock();
        routes.subscribers.remove(&channels.recv_data);
        routes.subscribers.remove(&channels.recv_control);
    }

    fn session_keys(&self, connection: &RelayConnection, queue_id: &str) -> Vec<(String, Side)> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().0 == queue_id && entry.connection == connection.id())
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn send_control(
        &self,
        connection: &RelayConnection,
        channel: &str,
        queue_id: &str,
        kind: ControlKind,
    ) -> Result<()> {
        if !is_control_channel(channel) {
            return Err(TunnelError::protocol(format!(
                "{channel} is not a control channel"
            )));
        }
        self.ensure_sendable(connection, channel)?;
        self.deliver(RelayMessage::new(channel, format!("{kind} {queue_id}")));
        Ok(())
    }
}

fn parse_control(message: &RelayMessage) -> Result<(ControlKind, &str)> {
    if !is_control_channel(message.channel()) {
        return Err(TunnelError::protocol(format!(
            "message on {} is not a control message",
            message.channel()
        )));
    }
    let text = std::str::from_utf8(message.payload())
        .map_err(|_| TunnelError::protocol("control message is not text"))?;
    let (kind, queue_id) = text
        .split_once(' ')
        .ok_or_else(|| TunnelError::protocol(format!("malformed control message: {text}")))?;
    Ok((kind.parse()?, queue_id))
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn create_connection(
        &self,
        host: &str,
        port: u16,
        secure: bool,
    ) -> Result<RelayConnection> {
        if host.trim().is_empty() || port == 0 {
            return Err(TunnelError::relay(format!(
                "invalid relay endpoint {host}:{port}"
            )));
        }
        let connection = RelayConnection::new(host, port, secure);
        self.connections.insert(connection.id(), false);
        tracing::debug!(
            connection_id = %connection.id(),
            host = %host,
            port = port,
            "relay connection opened"
        );
        Ok(connection)
    }

    fn is_connection_closed(&self, connection: &RelayConnection) -> bool {
        self.connections
            .get(&connection.id())
            .map_or(true, |closed| *closed)
    }

    async fn close_connection(&self, connection: &RelayConnection) {
        if let Some(mut closed) = self.connections.get_mut(&connection.id()) {
            *closed = true;
        }

        let orphaned: Vec<(String, Side)> = self
            .sessions
            .iter()
            .filter(|entry| entry.connection == connection.id())
            .map(|entry| entry.key().clone())
            .collect();
        for key in orphaned {
            if let Some((_, entry)) = self.sessions.remove(&key) {
                self.unroute(&entry.channels);
            }
        }

        tracing::debug!(connection_id = %connection.id(), "relay connection closed");
    }

    async fn open_session_channels(
        &self,
        connection: &RelayConnection,
        queue_id: &str,
        side: Side,
        listener: Arc<dyn RelayMessageListener>,
    ) -> Result<SessionChannels> {
        self.ensure_open(connection)?;

        let key = (queue_id.to_string(), side);
        if self.sessions.contains_key(&key) {
            return Err(TunnelError::relay(format!(
                "{side:?} channels for {queue_id} already open"
            )));
        }

        let channels = SessionChannels::for_side(queue_id, side);
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayMessage>();

        {
            let mut routes = self.routes.lock();
            for channel in [&channels.recv_data, &channels.recv_control] {
                for message in routes.backlog.remove(channel).unwrap_or_default() {
                    // The receiver is alive: it is dropped only when this task ends.
                    let _ = tx.send(message);
                }
                routes.subscribers.insert(channel.clone(), tx.clone());
            }
        }

        self.sessions.insert(
            key,
            SessionEntry {
                connection: connection.id(),
                channels: channels.clone(),
            },
        );

        let dispatch_queue = queue_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                listener.on_message(message).await;
            }
            tracing::debug!(queue_id = %dispatch_queue, side = ?side, "relay dispatcher finished");
        });

        Ok(channels)
    }

    async fn send_bytes(
        &self,
        connection: &RelayConnection,
        channel: &str,
        _peer_key: &PeerPublicKey,
        bytes: &[u8],
    ) -> Result<()> {
        self.ensure_sendable(connection, channel)?;
        self.deliver(RelayMessage::new(channel, Bytes::copy_from_slice(bytes)));
        Ok(())
    }

    fn get_bytes_from_message(
        &self,
        message: &RelayMessage,
        _peer_key: &PeerPublicKey,
    ) -> Result<Bytes> {
        if is_control_channel(message.channel()) {
            return Err(TunnelError::protocol(format!(
                "message on {} carries no data",
                message.channel()
            )));
        }
        Ok(message.payload().clone())
    }

    fn control_kind(&self, message: &RelayMessage) -> Result<ControlKind> {
        parse_control(message).map(|(kind, _)| kind)
    }

    fn handle_close_control_message(
        &self,
        message: &RelayMessage,
        _connection: &RelayConnection,
    ) -> Result<()> {
        let (kind, queue_id) = parse_control(message)?;
        if kind != ControlKind::Close {
            return Err(TunnelError::protocol(format!(
                "expected CLOSE control message, got {kind}"
            )));
        }
        match queue_id_of(message.channel()) {
            Some(expected) if expected == queue_id => Ok(()),
            _ => Err(TunnelError::protocol(format!(
                "close for {queue_id} arrived on {}",
                message.channel()
            ))),
        }
    }

    async fn send_close_control_message(
        &self,
        connection: &RelayConnection,
        channel: &str,
        queue_id: &str,
    ) -> Result<()> {
        self.send_control(connection, channel, queue_id, ControlKind::Close)
            .await
    }

    async fn send_switch_control_message(
        &self,
        connection: &RelayConnection,
        channel: &str,
        queue_id: &str,
    ) -> Result<()> {
        self.send_control(connection, channel, queue_id, ControlKind::Switch)
            .await
    }

    async fn unsubscribe_from_queues(
        &self,
        connection: &RelayConnection,
        queue_id: &str,
    ) -> Result<()> {
        for key in self.session_keys(connection, queue_id) {
            if let Some(entry) = self.sessions.get(&key) {
                self.unroute(&entry.channels);
            }
        }
        Ok(())
    }

    async fn destroy_queues(&self, connection: &RelayConnection, queue_id: &str) -> Result<bool> {
        for key in self.session_keys(connection, queue_id) {
            if let Some((_, entry)) = self.sessions.remove(&key) {
                self.unroute(&entry.channels);
                let mut routes = self.routes.lock();
                routes.backlog.remove(&entry.channels.send_data);
                routes.backlog.remove(&entry.channels.send_control);
            }
        }

        let closeable = !self
            .sessions
            .iter()
            .any(|entry| entry.connection == connection.id());
        Ok(closeable)
    }
}
