//! Connection lifecycle states.
//!
//! Every [`BusConnection`](crate::BusConnection) is in exactly one
//! [`ConnectionState`] at a time. Transitions follow the table below; the
//! event loop is the only place that performs them.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | `Disconnected`/`Error`/`Waiting` | `connect()` | `Connecting` |
//! | `Connecting` | transport opened | `Connected` |
//! | `Connecting` | open failed (transient) | `Waiting` |
//! | `Connecting` | open failed (configuration) | `Error` |
//! | `Connected` | link lost | `Error`, then `Waiting` |
//! | any but `Disconnecting`/`Disconnected` | `disconnect()` | `Disconnecting`, then `Disconnected` |
//! | `Waiting` | retry timer fired | `Connecting` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a bus connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No link and nothing scheduled.
    #[default]
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Link established; reads and writes flow.
    Connected,
    /// Tearing the link down on request.
    Disconnecting,
    /// Link down, reconnect scheduled.
    Waiting,
    /// Link failed. Followed by `Waiting` unless the failure was permanent.
    Error,
}

impl ConnectionState {
    /// Returns the wire-style name of the state.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Waiting => "WAITING",
            Self::Error => "ERROR",
        }
    }

    /// Returns `true` if `connect()` starts an attempt from this state.
    #[inline]
    #[must_use]
    pub const fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error | Self::Waiting)
    }

    /// Returns `true` if `disconnect()` has work to do from this state.
    #[inline]
    #[must_use]
    pub const fn accepts_disconnect(self) -> bool {
        !matches!(self, Self::Disconnecting | Self::Disconnected)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected | Error | Waiting, Connecting) => true,
            (Connecting, Connected | Waiting | Error) => true,
            (Connected, Error) => true,
            (Error, Waiting) => true,
            (Connected | Connecting | Waiting | Error, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
