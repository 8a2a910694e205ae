//! Type-safe identifiers for connections and endpoints.
//!
//! Newtype wrappers prevent mixing an endpoint key with an arbitrary string
//! or a connection id with another UUID.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// EndpointKey
// ============================================================================

/// Immutable key identifying the far end of a [`BusConnection`](crate::BusConnection).
///
/// Typically host, port and mode (`"10.0.0.5:3671/tunnelling"`) or a bus
/// address. Two connections with equal keys talk to the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EndpointKey(Arc<str>);

impl EndpointKey {
    /// Creates a new endpoint key.
    #[inline]
    #[must_use]
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Returns the key as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the key is empty or whitespace only.
    #[inline]
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for EndpointKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<EndpointKey> for String {
    fn from(key: EndpointKey) -> Self {
        key.0.to_string()
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Unique identifier of one [`BusConnection`](crate::BusConnection) instance.
///
/// Distinguishes two connections to the same endpoint in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// ============================================================================
// Tests
// ============================================================================
