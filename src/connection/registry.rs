//! Per-endpoint sharing of bus connections.
//!
//! Several data point bindings usually talk to the same gateway. The
//! registry hands out one [`BusConnection`] per [`EndpointKey`] and counts
//! its users; the last [`release`](ConnectionRegistry::release) shuts the
//! connection down.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │            ConnectionRegistry              │
//! │  ┌──────────────────────────────────────┐  │
//! │  │ "10.0.0.5:3671" → BusConnection (x3) │  │
//! │  │ "10.0.0.9:3671" → BusConnection (x1) │  │
//! │  └──────────────────────────────────────┘  │
//! └────────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identifiers::EndpointKey;

use super::bus::BusConnection;
use super::transport::Transport;

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Shares one [`BusConnection`] per endpoint among its users.
///
/// Thread-safe; typically held in an `Arc` by the binding layer.
pub struct ConnectionRegistry<T: Transport> {
    /// Live connections with their user counts.
    connections: RwLock<FxHashMap<EndpointKey, Entry<T>>>,
}

struct Entry<T: Transport> {
    connection: BusConnection<T>,
    users: usize,
}

impl<T: Transport> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ConnectionRegistry - Public API
// ============================================================================

impl<T: Transport> ConnectionRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the connection for `endpoint`, creating it with `make` if
    /// there is none. Counts one more user either way.
    ///
    /// `make` runs under the registry lock and must not call back into the
    /// registry.
    ///
    /// # Errors
    ///
    /// Propagates the error from `make`; nothing is registered in that case.
    pub fn get_or_create<F>(&self, endpoint: &EndpointKey, make: F) -> Result<BusConnection<T>>
    where
        F: FnOnce(&EndpointKey) -> Result<BusConnection<T>>,
    {
        let mut connections = self.connections.write();

        if let Some(entry) = connections.get_mut(endpoint) {
            entry.users += 1;
            debug!(endpoint = %endpoint, users = entry.users, "Reusing bus connection");
            return Ok(entry.connection.clone());
        }

        let connection = make(endpoint)?;
        connections.insert(
            endpoint.clone(),
            Entry {
                connection: connection.clone(),
                users: 1,
            },
        );
        info!(endpoint = %endpoint, id = %connection.id(), "Bus connection registered");

        Ok(connection)
    }

    /// Returns the connection for `endpoint` without counting a user.
    #[must_use]
    pub fn get(&self, endpoint: &EndpointKey) -> Option<BusConnection<T>> {
        self.connections
            .read()
            .get(endpoint)
            .map(|entry| entry.connection.clone())
    }

    /// Returns the number of users of `endpoint`, 0 if unknown.
    #[must_use]
    pub fn user_count(&self, endpoint: &EndpointKey) -> usize {
        self.connections
            .read()
            .get(endpoint)
            .map_or(0, |entry| entry.users)
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Drops one user of `endpoint`. The last user shuts the connection down.
    ///
    /// Returns `true` if the connection was shut down.
    pub async fn release(&self, endpoint: &EndpointKey) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            let Some(entry) = connections.get_mut(endpoint) else {
                warn!(endpoint = %endpoint, "Release of unknown endpoint ignored");
                return false;
            };

            entry.users -= 1;
            if entry.users > 0 {
                debug!(endpoint = %endpoint, users = entry.users, "Bus connection still in use");
                return false;
            }
            connections.remove(endpoint)
        };

        if let Some(entry) = removed {
            entry.connection.shutdown().await;
            info!(endpoint = %endpoint, "Bus connection closed");
        }
        true
    }

    /// Shuts down every connection regardless of its users.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut map = self.connections.write();
            map.drain().collect()
        };

        info!(count = connections.len(), "Connection registry shutting down");
        for (endpoint, entry) in connections {
            entry.connection.shutdown().await;
            debug!(endpoint = %endpoint, "Connection closed during shutdown");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::connection::backoff::BackoffConfig;
    use crate::connection::mock::{MockTransport, Probe};
    use crate::connection::state::ConnectionState;
    use crate::error::Error;

    fn factory(probe: &Probe) -> impl FnOnce(&EndpointKey) -> Result<BusConnection<MockTransport>> {
        let transport = MockTransport::new(probe.clone());
        move |endpoint| {
            BusConnection::builder()
                .endpoint(endpoint.clone())
                .transport(transport)
                .backoff(BackoffConfig::default())
                .build()
        }
    }

    #[tokio::test]
    async fn test_same_endpoint_shares_connection() {
        let registry = ConnectionRegistry::new();
        let probe = Probe::default();
        let key = EndpointKey::new("gw-1");

        let first = registry.get_or_create(&key, factory(&probe)).unwrap();
        let second = registry.get_or_create(&key, factory(&probe)).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(registry.user_count(&key), 2);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_last_release_shuts_down() {
        let registry = ConnectionRegistry::new();
        let probe = Probe::default();
        let key = EndpointKey::new("gw-1");

        let connection = registry.get_or_create(&key, factory(&probe)).unwrap();
        registry.get_or_create(&key, factory(&probe)).unwrap();
        connection.connect().await;

        assert!(!registry.release(&key).await);
        assert_eq!(connection.state(), ConnectionState::Connected);

        assert!(registry.release(&key).await);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(probe.close_count(), 1);
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_release_unknown_endpoint_is_ignored() {
        let registry = ConnectionRegistry::<MockTransport>::new();
        assert!(!registry.release(&EndpointKey::new("nowhere")).await);
    }

    #[tokio::test]
    async fn test_failed_create_registers_nothing() {
        let registry = ConnectionRegistry::<MockTransport>::new();
        let key = EndpointKey::new("gw-1");

        let result = registry.get_or_create(&key, |_| Err(Error::config("bad gateway settings")));

        assert!(result.is_err());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let registry = ConnectionRegistry::new();
        let probe = Probe::default();

        let a = registry
            .get_or_create(&EndpointKey::new("gw-1"), factory(&probe))
            .unwrap();
        let b = registry
            .get_or_create(&EndpointKey::new("gw-2"), factory(&probe))
            .unwrap();
        a.connect().await;
        b.connect().await;

        registry.shutdown().await;

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(probe.close_count(), 2);
    }
}
