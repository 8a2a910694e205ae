//! Resource identity.
//!
//! A [`ResourceKey`] is a device descriptor plus the parameters it is opened
//! with. Two keys that differ only in parameters name different resources:
//! `COM3@9600-8N1` and `COM3@19200-8N1` are never shared.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============================================================================
// ResourceKey
// ============================================================================

/// Identity of a shared physical resource.
///
/// Displays as `descriptor@params`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey<P> {
    /// Device path or name (e.g., "/dev/ttyUSB0", "COM3").
    descriptor: Arc<str>,
    /// Open parameters.
    params: P,
}

impl<P> ResourceKey<P> {
    /// Creates a key.
    #[inline]
    #[must_use]
    pub fn new(descriptor: impl AsRef<str>, params: P) -> Self {
        Self {
            descriptor: Arc::from(descriptor.as_ref()),
            params,
        }
    }

    /// Returns the device descriptor.
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Returns the open parameters.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &P {
        &self.params
    }
}

impl<P: fmt::Display> fmt::Display for ResourceKey<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.descriptor, self.params)
    }
}

// ============================================================================
// Parity
// ============================================================================

/// Serial parity mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always 1.
    Mark,
    /// Parity bit always 0.
    Space,
}

impl Parity {
    /// Returns the single-letter code used in `8N1` notation.
    #[inline]
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
            Self::Mark => 'M',
            Self::Space => 'S',
        }
    }
}

// ============================================================================
// SerialParams
// ============================================================================

/// Line settings of a serial port.
///
/// Defaults to `9600-8N1`. Deserializable for the configuration layer:
///
/// ```json
/// { "baud_rate": 19200, "parity": "even" }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialParams {
    /// Bits per second.
    pub baud_rate: u32,
    /// Data bits per frame (5-8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Parity mode.
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self::new(9600)
    }
}

impl SerialParams {
    /// Creates 8N1 settings at `baud_rate`.
    #[inline]
    #[must_use]
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }

    /// Sets the data bits.
    #[inline]
    #[must_use]
    pub const fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Sets the stop bits.
    #[inline]
    #[must_use]
    pub const fn with_stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Sets the parity.
    #[inline]
    #[must_use]
    pub const fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
}

impl fmt::Display for SerialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.code(),
            self.stop_bits
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ResourceKey::new("COM3", SerialParams::new(9600));
        assert_eq!(key.to_string(), "COM3@9600-8N1");
        assert_eq!(key.descriptor(), "COM3");
    }

    #[test]
    fn test_params_display_with_parity() {
        let params = SerialParams::new(19200)
            .with_data_bits(7)
            .with_parity(Parity::Even)
            .with_stop_bits(2);
        assert_eq!(params.to_string(), "19200-7E2");
    }

    #[test]
    fn test_params_distinguish_keys() {
        let a = ResourceKey::new("COM3", SerialParams::new(9600));
        let b = ResourceKey::new("COM3", SerialParams::new(19200));
        let c = ResourceKey::new("COM3", SerialParams::new(9600));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let params: SerialParams =
            serde_json::from_str(r#"{ "baud_rate": 19200, "parity": "even" }"#).unwrap();
        assert_eq!(params.baud_rate, 19200);
        assert_eq!(params.data_bits, 8);
        assert_eq!(params.stop_bits, 1);
        assert_eq!(params.parity, Parity::Even);
    }
}
