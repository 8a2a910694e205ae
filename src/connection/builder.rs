//! Builder pattern for bus connections.
//!
//! Provides a fluent API for configuring and creating [`BusConnection`]
//! instances.
//!
//! # Example
//!
//! ```ignore
//! let connection = BusConnection::builder()
//!     .endpoint("192.168.1.10:3671/tunnelling")
//!     .transport(tunnel)
//!     .backoff(BackoffConfig::new().with_max_delay(Duration::from_secs(30)))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};
use crate::identifiers::EndpointKey;

use super::backoff::BackoffConfig;
use super::bus::BusConnection;
use super::transport::Transport;

// ============================================================================
// BusConnectionBuilder
// ============================================================================

/// Builder for configuring a [`BusConnection`].
///
/// Use [`BusConnection::builder()`] to create a new builder.
pub struct BusConnectionBuilder<T> {
    /// Endpoint identity.
    endpoint: Option<EndpointKey>,
    /// Protocol driver.
    transport: Option<T>,
    /// Reconnect backoff.
    backoff: BackoffConfig,
}

impl<T> Default for BusConnectionBuilder<T> {
    fn default() -> Self {
        Self {
            endpoint: None,
            transport: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl<T> fmt::Debug for BusConnectionBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnectionBuilder")
            .field("endpoint", &self.endpoint)
            .field("transport", &self.transport.is_some())
            .field("backoff", &self.backoff)
            .finish()
    }
}

// ============================================================================
// BusConnectionBuilder Implementation
// ============================================================================

impl<T> BusConnectionBuilder<T> {
    /// Creates a new builder with default backoff and nothing else set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the endpoint key.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Endpoint identity (e.g., "192.168.1.10:3671/tunnelling")
    #[inline]
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<EndpointKey>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the transport driving the link.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the reconnect backoff.
    #[inline]
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl<T: Transport> BusConnectionBuilder<T> {
    /// Builds the connection and starts its event loop.
    ///
    /// The connection starts `Disconnected`; call
    /// [`connect`](BusConnection::connect) to open the link. Must be called
    /// from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidEndpoint`] if the endpoint is missing or blank
    /// - [`Error::Config`] if no transport is set or the backoff is invalid
    pub fn build(self) -> Result<BusConnection<T>> {
        let endpoint = self.validate_endpoint()?;
        self.backoff.validate()?;

        let transport = self.transport.ok_or_else(|| {
            Error::config(
                "Transport is required. Use .transport() to set it.\n\
                 Example: BusConnection::builder().transport(tunnel)",
            )
        })?;

        Ok(BusConnection::spawn(endpoint, transport, self.backoff))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl<T> BusConnectionBuilder<T> {
    /// Validates the endpoint configuration.
    fn validate_endpoint(&self) -> Result<EndpointKey> {
        let endpoint = self.endpoint.clone().ok_or_else(|| {
            Error::invalid_endpoint(
                "",
                "Endpoint is required. Use .endpoint() to set it.\n\
                 Example: BusConnection::builder().endpoint(\"192.168.1.10:3671\")",
            )
        })?;

        if endpoint.is_blank() {
            return Err(Error::invalid_endpoint(endpoint.as_str(), "Endpoint is blank"));
        }

        Ok(endpoint)
    }
}

// ============================================================================
// Tests
// ============================================================================
