//! Device Link - reconnecting device connections and shared physical resources.
//!
//! This library provides the connection plumbing that field-bus protocol
//! adapters (KNX/IP tunnels, gateway sockets, Modbus RTU lines) build on.
//!
//! # Architecture
//!
//! Two independent components:
//!
//! - **[`BusConnection`]**: one logical link to an endpoint. Reconnects with
//!   exponential backoff, notifies status observers of every state change,
//!   and multiplexes data point consumers through a last-value cache.
//! - **[`SharedResourceManager`]**: reference-counted sharing of exclusive
//!   physical resources (serial ports) with serialized I/O and deferred close.
//!
//! Key design principles:
//!
//! - Each [`BusConnection`] owns: transport + event loop task + address cache
//! - Every state transition happens on the event loop (totally ordered)
//! - Consumers and observers are isolated: a panic in one never stops delivery
//! - Blocking device I/O runs on tokio's blocking pool
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use device_link::{BusConnection, ConnectionState, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = BusConnection::builder()
//!         .endpoint("192.168.1.10:3671/tunnelling")
//!         .transport(tunnel)
//!         .build()?;
//!
//!     connection.add_status_observer(Arc::new(|state: ConnectionState| {
//!         println!("link: {state}");
//!     }));
//!     connection.subscribe(address, Arc::new(|value: Option<&f32>| {
//!         println!("value: {value:?}");
//!     }));
//!     connection.connect().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`BusConnection`], states, backoff, [`AddressCache`] |
//! | [`resource`] | [`SharedResourceManager`] and [`ResourceHandle`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Reconnecting bus connections.
///
/// - [`BusConnection`] - Connection handle (owns an event loop task)
/// - [`ConnectionState`] - Lifecycle state
/// - [`AddressCache`] - Last value per address and consumer fan-out
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections and endpoints.
pub mod identifiers;

/// Reference-counted shared physical resources.
///
/// Use [`SharedResourceManager::acquire`] to obtain a [`ResourceHandle`].
pub mod resource;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{
    AddressCache, Backoff, BackoffConfig, BusConnection, BusConnectionBuilder,
    ConnectionRegistry, ConnectionState, Consumer, LinkEvents, StatusObserver, SubscribeOutcome,
    Transport,
};

// Resource types
pub use resource::{
    HandleFor, ManagerOptions, Parity, PhysicalResource, ResourceFactory, ResourceHandle,
    ResourceKey, SerialParams, SharedResourceManager,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, EndpointKey};
