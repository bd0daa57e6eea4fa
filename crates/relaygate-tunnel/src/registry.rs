//! Session registry and the consumer-side port pool
//!
//! The [`SessionRegistry`] is constructed once per gateway and handed to every
//! worker, handler and the sweeper. All maps are safe to read, write and iterate
//! concurrently.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::consumer::ConsumerSideWorker;
use crate::provider::ProviderSideHandler;
use crate::session::ActiveSession;

// =============================================================================
// Port Pool
// =============================================================================

/// FIFO pool of ports reserved for consumer-side listeners
#[derive(Debug, Default)]
pub struct PortPool {
    available: Mutex<VecDeque<u16>>,
}

impl PortPool {
    /// Create a pool holding `ports`, leased in the given order
    #[must_use]
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            available: Mutex::new(ports.into_iter().collect()),
        }
    }

    /// Lease the port at the head of the pool
    ///
    /// Returns `None` when every port is leased.
    #[must_use]
    pub fn lease(self: &Arc<Self>) -> Option<PortLease> {
        let port = self.available.lock().pop_front()?;
        Some(PortLease {
            port,
            pool: Some(Arc::clone(self)),
        })
    }

    /// Get the number of ports not currently leased
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }

    /// Whether `port` is currently in the pool
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.available.lock().contains(&port)
    }

    fn give_back(&self, port: u16) {
        self.available.lock().push_back(port);
    }
}

/// A leased port; goes back to the tail of its pool exactly once
///
/// The port is returned by [`PortLease::release`] or, failing that, on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Option<Arc<PortPool>>,
}

impl PortLease {
    /// The leased port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the port to the pool now
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(self.port);
            tracing::debug!(port = self.port, "port returned to pool");
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.give_back();
    }
}

// =============================================================================
// Session Registry
// =============================================================================

/// Active-session registries of one gateway
#[derive(Debug)]
pub struct SessionRegistry {
    /// Session records by queue id, both sides
    active_sessions: DashMap<String, Arc<ActiveSession>>,
    /// Consumer-side workers by queue id
    consumer_workers: DashMap<String, Arc<ConsumerSideWorker>>,
    /// Provider-side handlers by queue id
    provider_handlers: DashMap<String, Arc<ProviderSideHandler>>,
    /// Ports available to consumer-side listeners
    ports: Arc<PortPool>,
}

impl SessionRegistry {
    /// Create a registry whose port pool holds `ports`
    #[must_use]
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            active_sessions: DashMap::new(),
            consumer_workers: DashMap::new(),
            provider_handlers: DashMap::new(),
            ports: Arc::new(PortPool::new(ports)),
        }
    }

    /// The consumer-side port pool
    #[must_use]
    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    // -------------------------------------------------------------------------
    // Active sessions
    // -------------------------------------------------------------------------

    /// Record a session as active
    pub fn insert_session(&self, session: Arc<ActiveSession>) {
        self.active_sessions
            .insert(session.queue_id.clone(), session);
    }

    /// Remove a session record, returning it if it was present
    pub fn remove_session(&self, queue_id: &str) -> Option<Arc<ActiveSession>> {
        self.active_sessions.remove(queue_id).map(|(_, s)| s)
    }

    /// Get a session record by queue id
    #[must_use]
    pub fn get_session(&self, queue_id: &str) -> Option<Arc<ActiveSession>> {
        self.active_sessions
            .get(queue_id)
            .map(|entry| Arc::clone(&entry))
    }

    /// Get the number of active sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.active_sessions.len()
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    /// Register a consumer-side worker
    pub fn insert_consumer(&self, worker: Arc<ConsumerSideWorker>) {
        self.consumer_workers
            .insert(worker.queue_id().to_string(), worker);
    }

    /// Unregister a consumer-side worker
    pub fn remove_consumer(&self, queue_id: &str) -> Option<Arc<ConsumerSideWorker>> {
        self.consumer_workers.remove(queue_id).map(|(_, w)| w)
    }

    /// Get a consumer-side worker by queue id
    #[must_use]
    pub fn get_consumer(&self, queue_id: &str) -> Option<Arc<ConsumerSideWorker>> {
        self.consumer_workers
            .get(queue_id)
            .map(|entry| Arc::clone(&entry))
    }

    /// Snapshot of all registered consumer-side workers
    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<ConsumerSideWorker>> {
        self.consumer_workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Get the number of registered consumer-side workers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumer_workers.len()
    }

    // -------------------------------------------------------------------------
    // Provider side
    // -------------------------------------------------------------------------

    /// Register a provider-side handler
    pub fn insert_provider(&self, handler: Arc<ProviderSideHandler>) {
        self.provider_handlers
            .insert(handler.queue_id().to_string(), handler);
    }

    /// Unregister a provider-side handler
    pub fn remove_provider(&self, queue_id: &str) -> Option<Arc<ProviderSideHandler>> {
        self.provider_handlers.remove(queue_id).map(|(_, h)| h)
    }

    /// Get a provider-side handler by queue id
    #[must_use]
    pub fn get_provider(&self, queue_id: &str) -> Option<Arc<ProviderSideHandler>> {
        self.provider_handlers
            .get(queue_id)
            .map(|entry| Arc::clone(&entry))
    }

    /// Snapshot of all registered provider-side handlers
    #[must_use]
    pub fn providers(&self) -> Vec<Arc<ProviderSideHandler>> {
        self.provider_handlers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Get the number of registered provider-side handlers
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.provider_handlers.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(8000..=8100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PeerPublicKey;

    fn test_session(queue_id: &str) -> Arc<ActiveSession> {
        let key = PeerPublicKey::parse("cHJvdmlkZXIta2V5").unwrap();
        Arc::new(ActiveSession::new(queue_id, key).unwrap())
    }

    #[test]
    fn test_port_pool_is_fifo() {
        let pool = Arc::new(PortPool::new([9000, 9001, 9002]));

        let first = pool.lease().unwrap();
        let second = pool.lease().unwrap();
        assert_eq!(first.port(), 9000);
        assert_eq!(second.port(), 9001);

        first.release();
        let third = pool.lease().unwrap();
        let fourth = pool.lease().unwrap();
        assert_eq!(third.port(), 9002);
        assert_eq!(fourth.port(), 9000);
        assert!(pool.lease().is_none());
    }

    #[test]
    fn test_port_lease_returns_exactly_once() {
        let pool = Arc::new(PortPool::new([9000]));

        let lease = pool.lease().unwrap();
        assert_eq!(pool.available(), 0);
        lease.release();
        assert_eq!(pool.available(), 1);
        assert!(pool.contains(9000));

        // Dropping without an explicit release also returns the port.
        let lease = pool.lease().unwrap();
        drop(lease);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_session_records() {
        let registry = SessionRegistry::new(9000..=9001);
        registry.insert_session(test_session("q-1"));
        registry.insert_session(test_session("q-2"));
        assert_eq!(registry.session_count(), 2);
        assert!(registry.get_session("q-1").is_some());

        assert!(registry.remove_session("q-1").is_some());
        assert!(registry.remove_session("q-1").is_none());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_registry_pool_seeded_from_range() {
        let registry = SessionRegistry::new(9000..=9009);
        assert_eq!(registry.ports().available(), 10);
        assert_eq!(registry.consumer_count(), 0);
        assert_eq!(registry.provider_count(), 0);
    }
}
