//! Shared physical resources.
//!
//! Protocols that sit on one physical line (several Modbus RTU units on a
//! single RS485 port, say) must share the device instead of each opening it.
//! The [`SharedResourceManager`] hands out [`ResourceHandle`]s to a
//! reference-counted resource and closes it in the background once the last
//! holder releases it.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `key` | Resource identity and serial line settings |
//! | `factory` | Blocking device traits |
//! | `options` | Manager timeouts |
//! | `handle` | Exclusive I/O on a shared resource |
//! | `manager` | Reference counting and deferred close |

// ============================================================================
// Submodules
// ============================================================================

/// Blocking device traits.
pub mod factory;

/// Exclusive access handle.
pub mod handle;

/// Resource identity.
pub mod key;

/// Reference-counted resource registry.
pub mod manager;

/// Manager options.
pub mod options;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use factory::{PhysicalResource, ResourceFactory};
pub use handle::ResourceHandle;
pub use key::{Parity, ResourceKey, SerialParams};
pub use manager::{HandleFor, SharedResourceManager};
pub use options::ManagerOptions;
