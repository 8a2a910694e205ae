//! Reconnecting bus connections.
//!
//! A [`BusConnection`] keeps a link to one endpoint up, reconnecting with
//! exponential backoff, and multiplexes data point consumers over it through
//! an [`AddressCache`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   commands   ┌──────────────────┐
//! │ BusConnection handle │─────────────►│ EventLoop (task) │
//! │  subscribe / send    │              │  owns Transport  │
//! └──────────┬───────────┘              └────────┬─────────┘
//!            │                                   │ LinkEvents
//!            ▼                                   ▼
//!      ┌─────────────────────────────────────────────┐
//!      │ AddressCache: address → value + consumers   │
//!      └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `state` | Lifecycle states and legal transitions |
//! | `backoff` | Reconnect delay and retry timer |
//! | `cache` | Last value per address and consumer fan-out |
//! | `transport` | Protocol driver trait and link event sink |
//! | `bus` | Connection handle and event loop |
//! | `builder` | Connection builder with validation |
//! | `registry` | One shared connection per endpoint |

// ============================================================================
// Submodules
// ============================================================================

/// Reconnect delay computation and retry scheduling.
pub mod backoff;

/// Connection builder.
pub mod builder;

/// Connection handle and event loop.
pub mod bus;

/// Last-value cache and consumer fan-out.
pub mod cache;

/// Shared connections keyed by endpoint.
pub mod registry;

/// Lifecycle states.
pub mod state;

/// Protocol driver seam.
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use backoff::{Backoff, BackoffConfig};
pub use builder::BusConnectionBuilder;
pub use bus::{BusConnection, StatusObserver};
pub use cache::{AddressCache, Consumer, SubscribeOutcome};
pub use registry::ConnectionRegistry;
pub use state::ConnectionState;
pub use transport::{LinkEvents, Transport};
