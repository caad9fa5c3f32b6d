//! One transport connection per physical endpoint.
//!
//! Renderers grouped under the same coordinator share that coordinator's
//! [`Connection`], so every command to one device goes through one client
//! and one command lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::sonos::traits::{ConnectionFactory, TransportClient};
use crate::sonos::types::Endpoint;

/// An open channel to one network endpoint.
pub struct Connection {
    client: Arc<dyn TransportClient>,
    /// Held for the duration of a command sequence (e.g. flush + enqueue + seek).
    command_lock: Mutex<()>,
}

impl Connection {
    fn new(client: Arc<dyn TransportClient>) -> Self {
        Self {
            client,
            command_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        self.client.endpoint()
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn TransportClient> {
        &self.client
    }

    /// Waits until no other command sequence is running on this endpoint.
    pub async fn lock_commands(&self) -> MutexGuard<'_, ()> {
        self.command_lock.lock().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", self.endpoint())
            .finish()
    }
}

/// Maps endpoints to their single live [`Connection`].
///
/// Connections are never removed: an endpoint that stops being a coordinator
/// may become one again, and the renderer set is small and closed.
pub struct ConnectionRegistry {
    factory: Arc<dyn ConnectionFactory>,
    connections: DashMap<Endpoint, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            connections: DashMap::new(),
        }
    }

    /// Returns the connection for an endpoint, creating it on first use.
    pub fn get(&self, endpoint: &Endpoint) -> Arc<Connection> {
        if let Some(existing) = self.connections.get(endpoint) {
            return Arc::clone(existing.value());
        }

        // entry() holds the shard lock, so two racing callers cannot both construct
        self.connections
            .entry(endpoint.clone())
            .or_insert_with(|| {
                log::debug!("[Registry] New connection for {}", endpoint);
                Arc::new(Connection::new(self.factory.connect(endpoint)))
            })
            .value()
            .clone()
    }

    /// Returns the connection for an endpoint only if one exists.
    #[must_use]
    pub fn lookup(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.connections.get(endpoint).map(|c| Arc::clone(c.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::MockConnectionFactory;

    #[test]
    fn same_endpoint_yields_same_connection() {
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = ConnectionRegistry::new(factory.clone());
        let ep = Endpoint::new("10.0.0.1", 1400);

        let a = registry.get(&ep);
        let b = registry.get(&Endpoint::new("10.0.0.1", 1400));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(factory.connect_count(), 1);
    }

    #[test]
    fn port_is_part_of_the_key() {
        let registry = ConnectionRegistry::new(Arc::new(MockConnectionFactory::new()));
        let a = registry.get(&Endpoint::new("10.0.0.1", 1400));
        let b = registry.get(&Endpoint::new("10.0.0.1", 1401));

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(registry.lookup(&Endpoint::new("10.0.0.2", 1400)).is_none());
    }
}
