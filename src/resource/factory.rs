//! Physical resource seam.
//!
//! Both traits are blocking: the manager calls them from tokio's blocking
//! pool, never from an async task.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::hash::Hash;
use std::io;

// ============================================================================
// PhysicalResource
// ============================================================================

/// An open device (serial port, bus adapter) with blocking byte I/O.
pub trait PhysicalResource: Send + 'static {
    /// Writes `data`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the device error.
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Reads into `buf`, returning the number of bytes read.
    ///
    /// May return fewer bytes than requested once the device read timeout
    /// expires.
    ///
    /// # Errors
    ///
    /// Returns the device error.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Returns the number of bytes that can be read without blocking.
    ///
    /// # Errors
    ///
    /// Returns the device error.
    fn bytes_available(&self) -> io::Result<usize>;

    /// Returns `true` until the resource is closed.
    fn is_open(&self) -> bool;

    /// Closes the device. May block while the OS releases it.
    ///
    /// # Errors
    ///
    /// Returns the device error.
    fn close(&mut self) -> io::Result<()>;
}

// ============================================================================
// ResourceFactory
// ============================================================================

/// Opens physical resources for a
/// [`SharedResourceManager`](super::SharedResourceManager).
///
/// Injected at construction; tests supply an in-memory implementation.
pub trait ResourceFactory: Send + Sync + 'static {
    /// Open parameters, part of the resource identity.
    type Params: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// The resource this factory opens.
    type Resource: PhysicalResource;

    /// Opens `descriptor` with `params`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the device cannot be opened.
    fn open(&self, descriptor: &str, params: &Self::Params) -> io::Result<Self::Resource>;
}
