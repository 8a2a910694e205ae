//! Reference-counted sharing of physical resources.
//!
//! Several protocol instances often sit on one physical line: Modbus RTU
//! devices with different unit ids on the same RS485 port, for example. The
//! [`SharedResourceManager`] opens each [`ResourceKey`] once, counts its
//! holders, and closes it in the background when the last holder releases it.
//!
//! # Lifecycle
//!
//! ```text
//! acquire ──► open (blocking pool) ──► live, ref_count = 1
//! acquire ──► live, ref_count + 1
//! release ──► ref_count - 1 ── 0 ──► removed from live ──► close (pending)
//! acquire while close pending ──► wait (bounded) ──► open fresh
//! ```
//!
//! Closing can take the OS a while; `release` never waits for it.
//!
//! Opens are serialized per key by an open gate. Acquires of other keys, and
//! acquires of a key that is already live, never wait on that gate.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, oneshot};
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::factory::{PhysicalResource, ResourceFactory};
use super::handle::ResourceHandle;
use super::key::ResourceKey;
use super::options::ManagerOptions;

// ============================================================================
// Types
// ============================================================================

type Key<F> = ResourceKey<<F as ResourceFactory>::Params>;
type Locked<F> = Arc<AsyncMutex<<F as ResourceFactory>::Resource>>;
type Gate = Arc<AsyncMutex<()>>;

/// Handle type returned by a manager using factory `F`.
pub type HandleFor<F> =
    ResourceHandle<<F as ResourceFactory>::Params, <F as ResourceFactory>::Resource>;

/// An open resource and its holder count.
struct LiveEntry<R> {
    resource: Arc<AsyncMutex<R>>,
    ref_count: usize,
}

/// A background close, awaitable by any number of waiters.
struct PendingClose {
    /// Distinguishes closes of the same key opened at different times.
    id: u64,
    done: Shared<BoxFuture<'static, ()>>,
}

struct Registry<F: ResourceFactory> {
    live: FxHashMap<Key<F>, LiveEntry<F::Resource>>,
    pending: FxHashMap<Key<F>, PendingClose>,
    /// Open gates of keys with an acquire in progress.
    gates: FxHashMap<Key<F>, Gate>,
}

impl<F: ResourceFactory> Registry<F> {
    /// Adds a holder to a live resource.
    fn share(&mut self, key: &Key<F>) -> Option<Locked<F>> {
        let entry = self.live.get_mut(key)?;
        entry.ref_count += 1;
        info!(key = %key, ref_count = entry.ref_count, "Acquired shared resource");
        Some(Arc::clone(&entry.resource))
    }
}

struct Inner<F: ResourceFactory> {
    factory: Arc<F>,
    options: ManagerOptions,
    /// Runtime that runs background closes.
    runtime: Handle,
    registry: Mutex<Registry<F>>,
    shut_down: AtomicBool,
    next_close_id: AtomicU64,
}

// ============================================================================
// SharedResourceManager
// ============================================================================

/// Registry of shared physical resources.
///
/// Cheap to clone; clones share the registry.
///
/// # Example
///
/// ```ignore
/// let manager = SharedResourceManager::new(SerialPorts, ManagerOptions::default())?;
/// let key = ResourceKey::new("/dev/ttyUSB0", SerialParams::new(9600));
///
/// let port = manager.acquire(key.clone()).await?;
/// let reply = port.write_then_read(request, 8).await?;
/// manager.release(&key);
/// ```
pub struct SharedResourceManager<F: ResourceFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: ResourceFactory> Clone for SharedResourceManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ============================================================================
// SharedResourceManager - Constructor
// ============================================================================

impl<F: ResourceFactory> SharedResourceManager<F> {
    /// Creates a manager that opens resources with `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if called outside a tokio runtime.
    pub fn new(factory: F, options: ManagerOptions) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::config(format!(
                "SharedResourceManager must be created inside a tokio runtime: {e}"
            ))
        })?;

        debug!(
            cleanup_timeout_ms = options.cleanup_timeout_ms,
            "SharedResourceManager created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                factory: Arc::new(factory),
                options,
                runtime,
                registry: Mutex::new(Registry {
                    live: FxHashMap::default(),
                    pending: FxHashMap::default(),
                    gates: FxHashMap::default(),
                }),
                shut_down: AtomicBool::new(false),
                next_close_id: AtomicU64::new(1),
            }),
        })
    }

    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }
}

// ============================================================================
// SharedResourceManager - Acquire / Release
// ============================================================================

impl<F: ResourceFactory> SharedResourceManager<F> {
    /// Returns a handle to the resource for `key`, opening it if needed.
    ///
    /// If a close of the same key is still running, waits for it (bounded by
    /// the cleanup timeout) before opening a fresh resource. A wait that times
    /// out is logged and the open proceeds.
    ///
    /// Cancellation-safe: if the returned future is dropped while the factory
    /// is opening the resource, the resource is closed once the open returns.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::ResourceOpen`] if the factory cannot open the resource
    pub async fn acquire(&self, key: Key<F>) -> Result<HandleFor<F>> {
        self.ensure_running()?;

        let gate = {
            let mut registry = self.inner.registry.lock();
            if let Some(resource) = registry.share(&key) {
                return Ok(ResourceHandle::new(key, resource));
            }
            Arc::clone(registry.gates.entry(key.clone()).or_default())
        };

        let result = self.acquire_gated(&key, gate).await;
        self.inner.prune_gate(&key);
        result.map(|resource| ResourceHandle::new(key, resource))
    }

    /// Opens `key`, or joins it, while holding its open gate.
    async fn acquire_gated(&self, key: &Key<F>, gate: Gate) -> Result<Locked<F>> {
        let gate = gate.lock_owned().await;
        self.ensure_running()?;

        loop {
            let pending = {
                let mut registry = self.inner.registry.lock();
                if let Some(resource) = registry.share(key) {
                    return Ok(resource);
                }
                registry
                    .pending
                    .get(key)
                    .map(|close| (close.id, close.done.clone()))
            };

            match pending {
                Some((close_id, done)) => self.wait_for_close(key, close_id, done).await,
                None => break,
            }
        }

        info!(key = %key, "Opening shared resource");
        let (resource, _gate) = self.open(key, gate).await?;

        let resource = Arc::new(AsyncMutex::new(resource));
        self.inner.registry.lock().live.insert(
            key.clone(),
            LiveEntry {
                resource: Arc::clone(&resource),
                ref_count: 1,
            },
        );
        info!(key = %key, ref_count = 1, "Acquired shared resource");

        Ok(resource)
    }

    /// Drops one holder of `key`. The last holder schedules the close.
    ///
    /// Never blocks. Releasing a key that is not held logs a warning.
    pub fn release(&self, key: &Key<F>) {
        let mut registry = self.inner.registry.lock();

        let Some(entry) = registry.live.get_mut(key) else {
            warn!(key = %key, "Release of resource that was not acquired");
            return;
        };

        entry.ref_count -= 1;
        let ref_count = entry.ref_count;
        info!(key = %key, ref_count, "Released shared resource");
        if ref_count > 0 {
            return;
        }

        let Some(entry) = registry.live.remove(key) else {
            return;
        };

        // Spawned and registered under the same lock so the task cannot
        // unregister itself before it is registered.
        let close = self.spawn_close(key.clone(), entry.resource);
        registry.pending.insert(key.clone(), close);
        debug!(key = %key, "Close scheduled");
    }

    /// Opens `key` on the blocking pool.
    ///
    /// The gate travels with the open and comes back with the resource. If
    /// the caller is gone by the time the open returns, the resource is
    /// closed before the gate is released.
    async fn open(
        &self,
        key: &Key<F>,
        gate: OwnedMutexGuard<()>,
    ) -> Result<(F::Resource, OwnedMutexGuard<()>)> {
        let factory = Arc::clone(&self.inner.factory);
        let descriptor = key.descriptor().to_string();
        let params = key.params().clone();
        let orphan_key = key.to_string();
        let (opened_tx, opened_rx) = oneshot::channel();

        task::spawn_blocking(move || {
            let opened = factory.open(&descriptor, &params);
            if let Err((Ok(mut orphan), gate)) = opened_tx.send((opened, gate)) {
                warn!(key = %orphan_key, "Acquire cancelled during open, closing resource");
                if let Err(e) = orphan.close() {
                    warn!(key = %orphan_key, error = %e, "Failed to close shared resource");
                }
                drop(gate);
            }
        });

        let (opened, gate) = opened_rx.await.map_err(|_| {
            Error::resource_open(key, io::Error::other("open task ended without a result"))
        })?;

        let resource = opened.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to open shared resource");
            Error::resource_open(key, e)
        })?;
        Ok((resource, gate))
    }

    /// Waits for a pending close, dropping its tracking entry if the wait
    /// times out.
    async fn wait_for_close(
        &self,
        key: &Key<F>,
        close_id: u64,
        done: Shared<BoxFuture<'static, ()>>,
    ) {
        let limit = self.inner.options.cleanup_timeout();
        info!(key = %key, "Resource close pending, waiting");

        if timeout(limit, done).await.is_ok() {
            debug!(key = %key, "Pending close finished");
        } else {
            warn!(
                key = %key,
                timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "Pending close timed out, proceeding"
            );
        }
        self.inner.forget_close(key, close_id);
    }

    /// Runs the close of `resource` in the background.
    fn spawn_close(&self, key: Key<F>, resource: Locked<F>) -> PendingClose {
        let id = self.inner.next_close_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);

        let task = self.inner.runtime.spawn(async move {
            close_resource(&key, resource).await;
            inner.forget_close(&key, id);
        });

        PendingClose {
            id,
            done: async move {
                let _ = task.await;
            }
            .boxed()
            .shared(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }
}

impl<F: ResourceFactory> Inner<F> {
    /// Drops the open gate of `key` once no acquire holds or awaits it.
    fn prune_gate(&self, key: &Key<F>) {
        let mut registry = self.registry.lock();
        if registry
            .gates
            .get(key)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            registry.gates.remove(key);
        }
    }

    /// Drops the tracking entry of close `id`, if it is still the current one.
    fn forget_close(&self, key: &Key<F>, id: u64) {
        let mut registry = self.registry.lock();
        if registry.pending.get(key).is_some_and(|close| close.id == id) {
            registry.pending.remove(key);
        }
    }
}

/// Closes a resource once in-flight I/O has finished. Failures are logged.
async fn close_resource<P, R>(key: &ResourceKey<P>, resource: Arc<AsyncMutex<R>>)
where
    P: std::fmt::Display,
    R: PhysicalResource,
{
    let mut guard = resource.lock_owned().await;
    debug!(key = %key, "Closing shared resource");

    match task::spawn_blocking(move || guard.close()).await {
        Ok(Ok(())) => info!(key = %key, "Closed shared resource"),
        Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to close shared resource"),
        Err(e) => warn!(key = %key, error = %e, "Close task failed"),
    }
}

// ============================================================================
// SharedResourceManager - Cleanup / Shutdown
// ============================================================================

impl<F: ResourceFactory> SharedResourceManager<F> {
    /// Waits until every pending close has finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CleanupTimeout`] if closes are still running after
    /// `limit`.
    pub async fn await_pending_cleanups(&self, limit: Duration) -> Result<()> {
        let pending: Vec<_> = {
            let registry = self.inner.registry.lock();
            registry
                .pending
                .values()
                .map(|close| close.done.clone())
                .collect()
        };

        if pending.is_empty() {
            debug!("No pending cleanups");
            return Ok(());
        }

        info!(count = pending.len(), "Waiting for pending cleanups");
        if timeout(limit, join_all(pending)).await.is_err() {
            return Err(Error::cleanup_timeout(
                self.pending_cleanup_count(),
                u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            ));
        }

        debug!("All pending cleanups completed");
        Ok(())
    }

    /// Closes every live resource, waits for pending closes, and rejects
    /// further acquires.
    ///
    /// Holders still using a handle keep their reference; their next I/O
    /// fails at the device. Calling this twice is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            debug!("SharedResourceManager already shut down");
            return;
        }
        info!("SharedResourceManager shutting down");

        // Let in-flight opens finish; they register before releasing the gate.
        let gates: Vec<Gate> = self.inner.registry.lock().gates.values().cloned().collect();
        for gate in gates {
            drop(gate.lock().await);
        }

        let live: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.live.drain().collect()
        };
        for (key, entry) in live {
            info!(key = %key, ref_count = entry.ref_count, "Closing resource during shutdown");
            close_resource(&key, entry.resource).await;
        }

        let pending: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.pending.drain().collect()
        };
        let limit = self.inner.options.shutdown_task_timeout();
        for (key, close) in pending {
            if timeout(limit, close.done).await.is_err() {
                warn!(key = %key, "Pending close timed out during shutdown");
            }
        }

        info!("SharedResourceManager shutdown complete");
    }
}

// ============================================================================
// SharedResourceManager - Introspection
// ============================================================================

impl<F: ResourceFactory> SharedResourceManager<F> {
    /// Returns the number of holders of `key`, 0 if it is not open.
    #[must_use]
    pub fn ref_count(&self, key: &Key<F>) -> usize {
        self.inner
            .registry
            .lock()
            .live
            .get(key)
            .map_or(0, |entry| entry.ref_count)
    }

    /// Returns the number of open resources.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.registry.lock().live.len()
    }

    /// Returns the number of closes still running.
    #[must_use]
    pub fn pending_cleanup_count(&self) -> usize {
        self.inner.registry.lock().pending.len()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

// ============================================================================
// Tests
// ============================================================================
