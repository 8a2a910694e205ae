//! Error types for device-link.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! Fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use device_link::{Result, Error};
//!
//! async fn example(manager: &SharedResourceManager<MyFactory>) -> Result<()> {
//!     let handle = manager.acquire(key).await?;
//!     let reply = handle.write_then_read(vec![0x01, 0x03], 8).await?;
//!     Ok(())
//! }
//! ```
//!
//! `BusConnection` does not return connection failures; they show up as
//! [`ConnectionState`](crate::ConnectionState) transitions. The variants below that describe transport failures are what
//! a [`Transport`](crate::Transport) returns to the connection, which then
//! classifies them with [`Error::is_permanent`].
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration (permanent) | [`Error::Config`], [`Error::InvalidEndpoint`], [`Error::InvalidAddress`] |
//! | Connection (transient) | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::AckTimeout`] |
//! | Resource | [`Error::ResourceOpen`], [`Error::CleanupTimeout`], [`Error::ShutDown`] |
//! | Execution | [`Error::TaskFailed`] |
//! | External | [`Error::Io`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::task::JoinError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when builder or option values are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Endpoint cannot be resolved or is malformed.
    ///
    /// Permanent for the connection instance: no retry is scheduled.
    #[error("Invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint {
        /// The offending endpoint.
        endpoint: String,
        /// Why the endpoint was rejected.
        message: String,
    },

    /// Data point address has an invalid format.
    #[error("Invalid address {address}: {message}")]
    InvalidAddress {
        /// The offending address.
        address: String,
        /// Why the address was rejected.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level connection failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Link closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote end did not acknowledge a write in time.
    #[error("No acknowledgement after {timeout_ms}ms")]
    AckTimeout {
        /// Milliseconds waited for the acknowledgement.
        timeout_ms: u64,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// The OS refused to open a physical resource.
    #[error("Failed to open {key}: {source}")]
    ResourceOpen {
        /// Display form of the resource key.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: IoError,
    },

    /// Pending resource closes did not finish before the deadline.
    #[error("{pending} pending cleanup(s) still running after {timeout_ms}ms")]
    CleanupTimeout {
        /// Number of closes still pending.
        pending: usize,
        /// Milliseconds waited.
        timeout_ms: u64,
    },

    /// The manager or connection has been shut down.
    #[error("Shut down")]
    ShutDown,

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid endpoint error.
    #[inline]
    pub fn invalid_endpoint(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid address error.
    #[inline]
    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an acknowledgement timeout error.
    #[inline]
    pub fn ack_timeout(timeout_ms: u64) -> Self {
        Self::AckTimeout { timeout_ms }
    }

    /// Creates a resource open error.
    #[inline]
    pub fn resource_open(key: impl ToString, source: IoError) -> Self {
        Self::ResourceOpen {
            key: key.to_string(),
            source,
        }
    }

    /// Creates a cleanup timeout error.
    #[inline]
    pub fn cleanup_timeout(pending: usize, timeout_ms: u64) -> Self {
        Self::CleanupTimeout {
            pending,
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error requires operator action.
    ///
    /// A connection that fails to open with a permanent error goes to
    /// `Error` and does not schedule a reconnect.
    #[inline]
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::InvalidEndpoint { .. } | Self::InvalidAddress { .. }
        )
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AckTimeout { .. } | Self::CleanupTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::AckTimeout { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.is_permanent() && !matches!(self, Self::ShutDown)
    }
}

// ============================================================================
// Tests
// ============================================================================
