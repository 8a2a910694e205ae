//! Reconnect delay computation and retry scheduling.
//!
//! [`Backoff`] holds the delay for the next reconnect attempt. Each scheduled
//! retry uses the current delay and then multiplies it, clamped to the
//! configured maximum. Reaching `Connected` resets it.
//!
//! ```
//! use std::time::Duration;
//! use device_link::{Backoff, BackoffConfig};
//!
//! let mut backoff = Backoff::new(BackoffConfig::default());
//! assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(4000));
//! backoff.reset();
//! assert_eq!(backoff.current(), Duration::from_millis(1000));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;

/// Upper bound for the reconnect delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Factor applied after every failed attempt.
pub const DEFAULT_MULTIPLIER: u32 = 2;

// ============================================================================
// BackoffConfig
// ============================================================================

/// Reconnect backoff parameters.
///
/// Deserializable so the configuration layer can load it as-is:
///
/// ```json
/// { "initial_delay_ms": 500, "max_delay_ms": 30000, "multiplier": 3 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First reconnect delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier applied after each failure.
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffConfig {
    /// Creates the default configuration (1s, 60s, x2).
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    /// Sets the initial delay.
    #[inline]
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the maximum delay.
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the multiplier.
    #[inline]
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Returns the initial delay.
    #[inline]
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Returns the maximum delay.
    #[inline]
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Checks that the parameters describe a non-shrinking, bounded delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the initial delay is zero, the maximum is
    /// below the initial delay, or the multiplier is zero.
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(Error::config("Backoff initial delay must be greater than zero"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::config(format!(
                "Backoff max delay ({}ms) is below the initial delay ({}ms)",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.multiplier == 0 {
            return Err(Error::config("Backoff multiplier must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Current reconnect delay of one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current_ms: u64,
}

impl Backoff {
    /// Creates a backoff starting at the configured initial delay.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_ms: config.initial_delay_ms,
        }
    }

    /// Returns the delay the next scheduled retry will use.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Returns the delay for the retry being scheduled and advances.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = self
            .current_ms
            .saturating_mul(u64::from(self.config.multiplier))
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Returns to the initial delay.
    #[inline]
    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_delay_ms;
    }
}

// ============================================================================
// RetryScheduler
// ============================================================================

/// Holds the single outstanding reconnect timer of a connection.
#[derive(Debug, Default)]
pub(crate) struct RetryScheduler {
    pending: Option<JoinHandle<()>>,
}

impl RetryScheduler {
    /// Returns `true` while a timer is outstanding.
    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Runs `on_fire` after `delay` unless a timer is already outstanding.
    ///
    /// Returns `false` without scheduling anything in that case.
    pub(crate) fn schedule<F>(&mut self, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pending.is_some() {
            trace!("Retry already pending");
            return false;
        }

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
        true
    }

    /// Marks the outstanding timer as consumed.
    #[inline]
    pub(crate) fn fired(&mut self) {
        self.pending = None;
    }

    /// Aborts the outstanding timer, if any.
    pub(crate) fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_oversized_delays_saturate() {
        let config = BackoffConfig::new()
            .with_initial_delay(Duration::MAX)
            .with_max_delay(Duration::MAX);
        assert_eq!(config.initial_delay_ms, u64::MAX);
        assert_eq!(config.max_delay_ms, u64::MAX);
    }

    #[test]
    fn test_default_sequence_caps_at_max() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<_> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                ms(1000),
                ms(2000),
                ms(4000),
                ms(8000),
                ms(16000),
                ms(32000),
                ms(60000),
                ms(60000),
                ms(60000)
            ]
        );
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), ms(4000));
        backoff.reset();
        assert_eq!(backoff.current(), ms(1000));
    }

    #[test]
    fn test_multiplier_one_is_constant() {
        let mut backoff = Backoff::new(BackoffConfig::new().with_multiplier(1));
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), ms(1000));
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(BackoffConfig::new().validate().is_ok());
        assert!(BackoffConfig::new().with_initial_delay(ms(0)).validate().is_err());
        assert!(
            BackoffConfig::new()
                .with_initial_delay(ms(5000))
                .with_max_delay(ms(1000))
                .validate()
                .is_err()
        );
        assert!(BackoffConfig::new().with_multiplier(0).validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: BackoffConfig = serde_json::from_str(r#"{ "max_delay_ms": 30000 }"#).unwrap();
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
        assert_eq!(config.multiplier, 2);
    }

    proptest! {
        #[test]
        fn prop_delay_after_n_failures(
            initial in 1u64..5_000,
            extra in 0u64..100_000,
            multiplier in 1u32..6,
            failures in 0u32..40,
        ) {
            let config = BackoffConfig {
                initial_delay_ms: initial,
                max_delay_ms: initial + extra,
                multiplier,
            };
            let mut backoff = Backoff::new(config);
            for _ in 0..failures {
                backoff.next_delay();
            }

            let expected = (0..failures).fold(initial, |delay, _| {
                delay.saturating_mul(u64::from(multiplier)).min(initial + extra)
            });
            prop_assert_eq!(backoff.current(), ms(expected));
            prop_assert!(backoff.current() <= config.max_delay());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_allows_one_pending_retry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = RetryScheduler::default();

        let counter = Arc::clone(&fired);
        assert!(scheduler.schedule(ms(1000), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&fired);
        assert!(!scheduler.schedule(ms(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(scheduler.is_pending());

        tokio::time::sleep(ms(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        scheduler.fired();
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_retry_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = RetryScheduler::default();

        let counter = Arc::clone(&fired);
        scheduler.schedule(ms(1000), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel();

        tokio::time::sleep(ms(2000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_pending());
    }
}
