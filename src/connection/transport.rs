//! Transport driver seam.
//!
//! A protocol adapter implements [`Transport`] for its bus (KNX/IP tunnel,
//! gateway socket, serial line) and hands it to a
//! [`BusConnection`](crate::BusConnection). The connection's event loop owns
//! the transport and is the only caller of its methods.
//!
//! The transport reports incoming traffic through the [`LinkEvents`] it
//! receives in [`Transport::open`]. Payload translation stays in the adapter:
//! the connection never looks inside `Value`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::Result;

use super::bus::Command;
use super::cache::AddressCache;

// ============================================================================
// Transport
// ============================================================================

/// A connection-oriented driver for one endpoint.
///
/// Errors returned from [`open`](Transport::open) are classified with
/// [`Error::is_permanent`](crate::Error::is_permanent): configuration errors
/// park the connection in `Error`, anything else schedules a reconnect.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Data point address on the far side.
    type Address: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Value carried for an address.
    type Value: Clone + Send + Sync + 'static;

    /// Opens the link.
    ///
    /// Must return only once the link is ready for reads and writes. `events`
    /// stays valid until the next `open`; keep it to report values and link loss.
    async fn open(&mut self, events: LinkEvents<Self::Address, Self::Value>) -> Result<()>;

    /// Closes the link. Called on disconnect and after link loss.
    async fn close(&mut self) -> Result<()>;

    /// Writes `value` to `address` and waits for the acknowledgement.
    ///
    /// An error is treated as loss of the link.
    async fn write(&mut self, address: &Self::Address, value: Self::Value) -> Result<()>;

    /// Asks the far side to report the current value of `address`.
    ///
    /// The answer arrives later through [`LinkEvents::value_received`].
    async fn request_read(&mut self, address: &Self::Address) -> Result<()>;
}

// ============================================================================
// LinkEvents
// ============================================================================

/// Callback sink handed to a transport when its link opens.
///
/// Cheap to clone. Events from a link that has since been closed or replaced
/// are recognised by their generation and ignored. Holding a sink does not
/// keep the connection alive.
pub struct LinkEvents<A, V> {
    /// Link generation this sink belongs to.
    generation: u64,
    /// Generation of the link currently open, 0 when none is.
    active: Arc<AtomicU64>,
    /// Cache of the owning connection.
    cache: Arc<AddressCache<A, V>>,
    /// Event loop of the owning connection.
    command_tx: mpsc::WeakUnboundedSender<Command<A, V>>,
}

impl<A, V> Clone for LinkEvents<A, V> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            active: Arc::clone(&self.active),
            cache: Arc::clone(&self.cache),
            command_tx: self.command_tx.clone(),
        }
    }
}

impl<A, V> fmt::Debug for LinkEvents<A, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvents")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<A, V> LinkEvents<A, V>
where
    A: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    /// Creates a sink for link `generation`.
    pub(crate) fn new(
        generation: u64,
        active: Arc<AtomicU64>,
        cache: Arc<AddressCache<A, V>>,
        command_tx: mpsc::WeakUnboundedSender<Command<A, V>>,
    ) -> Self {
        Self {
            generation,
            active,
            cache,
            command_tx,
        }
    }

    /// Returns the link generation.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` while this sink's link is the open one.
    ///
    /// Before `open` has returned `Ok` this is `false`; values reported
    /// during the handshake are dropped.
    #[inline]
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.active.load(Ordering::Acquire) == self.generation
    }

    /// Reports a value (or `None` for a value that could not be decoded).
    ///
    /// Consumers are invoked synchronously on the calling thread, in
    /// registration order. Call this from a single thread per link to keep
    /// per-address ordering.
    pub fn value_received(&self, address: &A, value: Option<V>) {
        if !self.is_current() {
            trace!(generation = self.generation, ?address, "Value from stale link dropped");
            return;
        }
        trace!(generation = self.generation, ?address, "Value received");
        self.cache.on_value_received(address, value);
    }

    /// Reports that the link closed or failed without being asked to.
    pub fn link_closed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(generation = self.generation, %reason, "Link closed by transport");

        let delivered = self.command_tx.upgrade().is_some_and(|tx| {
            tx.send(Command::LinkLost {
                generation: self.generation,
                reason,
            })
            .is_ok()
        });

        if !delivered {
            trace!("Connection event loop already stopped");
        }
    }
}
