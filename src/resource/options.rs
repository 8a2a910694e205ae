//! Shared resource manager options.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use device_link::ManagerOptions;
//!
//! let options = ManagerOptions::new()
//!     .with_cleanup_timeout(Duration::from_secs(2))
//!     .with_shutdown_task_timeout(Duration::from_millis(500));
//!
//! assert_eq!(options.cleanup_timeout(), Duration::from_secs(2));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// How long `acquire` waits for a pending close of the same key.
pub const DEFAULT_CLEANUP_TIMEOUT_MS: u64 = 5000;

/// How long `shutdown` waits for each pending close.
pub const DEFAULT_SHUTDOWN_TASK_TIMEOUT_MS: u64 = 2000;

// ============================================================================
// ManagerOptions
// ============================================================================

/// Timeouts of a [`SharedResourceManager`](super::SharedResourceManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Wait bound for a pending close before reopening, in milliseconds.
    pub cleanup_timeout_ms: u64,

    /// Wait bound per pending close during shutdown, in milliseconds.
    pub shutdown_task_timeout_ms: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ManagerOptions {
    /// Creates options with the default timeouts (5s, 2s).
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cleanup_timeout_ms: DEFAULT_CLEANUP_TIMEOUT_MS,
            shutdown_task_timeout_ms: DEFAULT_SHUTDOWN_TASK_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ManagerOptions {
    /// Sets the pending-close wait bound used by `acquire`.
    #[inline]
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the per-close wait bound used by `shutdown`.
    #[inline]
    #[must_use]
    pub fn with_shutdown_task_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_task_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the pending-close wait bound.
    #[inline]
    #[must_use]
    pub const fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    /// Returns the per-close shutdown wait bound.
    #[inline]
    #[must_use]
    pub const fn shutdown_task_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_task_timeout_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================
