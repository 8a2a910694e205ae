//! Exclusive access to a shared resource.
//!
//! Every operation on a [`ResourceHandle`] takes the resource's lock for its
//! whole duration and runs the blocking I/O on tokio's blocking pool. Holders
//! of the same resource therefore never interleave within a cycle: a
//! [`write_then_read`](ResourceHandle::write_then_read) request and its
//! response belong to one caller.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task;
use tracing::trace;

use crate::error::Result;

use super::factory::PhysicalResource;
use super::key::ResourceKey;

// ============================================================================
// ResourceHandle
// ============================================================================

/// A holder's reference to a shared resource.
///
/// Returned by [`SharedResourceManager::acquire`](super::SharedResourceManager::acquire).
/// Dropping a handle does not release it; call
/// [`release`](super::SharedResourceManager::release) once per acquire.
pub struct ResourceHandle<P, R> {
    key: ResourceKey<P>,
    resource: Arc<AsyncMutex<R>>,
}

impl<P: Clone, R> Clone for ResourceHandle<P, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            resource: Arc::clone(&self.resource),
        }
    }
}

impl<P: fmt::Display, R> fmt::Debug for ResourceHandle<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key.to_string())
            .finish_non_exhaustive()
    }
}

impl<P, R> ResourceHandle<P, R>
where
    P: fmt::Display,
    R: PhysicalResource,
{
    pub(crate) fn new(key: ResourceKey<P>, resource: Arc<AsyncMutex<R>>) -> Self {
        Self { key, resource }
    }

    /// Returns the resource key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &ResourceKey<P> {
        &self.key
    }

    /// Returns `true` if both handles refer to the same open resource.
    #[inline]
    #[must_use]
    pub fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
    }

    /// Runs `f` with exclusive access to the resource.
    ///
    /// Use this for multi-step exchanges that must not be interleaved with
    /// other holders.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`](crate::Error::Io) if `f` fails
    /// - [`Error::TaskFailed`](crate::Error::TaskFailed) if `f` panics
    pub async fn exclusive<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut R) -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = Arc::clone(&self.resource).lock_owned().await;
        trace!(key = %self.key, "Exclusive access granted");

        let output = task::spawn_blocking(move || f(&mut *guard)).await??;
        Ok(output)
    }

    /// Writes `request` and reads up to `response_len` bytes as one unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if either step fails.
    pub async fn write_then_read(&self, request: Vec<u8>, response_len: usize) -> Result<Vec<u8>> {
        self.exclusive(move |resource| {
            resource.write_bytes(&request)?;
            let mut response = vec![0; response_len];
            let read = resource.read_bytes(&mut response)?;
            response.truncate(read);
            Ok(response)
        })
        .await
    }

    /// Writes `data`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) on device failure.
    pub async fn write_bytes(&self, data: Vec<u8>) -> Result<usize> {
        self.exclusive(move |resource| resource.write_bytes(&data)).await
    }

    /// Reads up to `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) on device failure.
    pub async fn read_bytes(&self, max_len: usize) -> Result<Vec<u8>> {
        self.exclusive(move |resource| {
            let mut buf = vec![0; max_len];
            let read = resource.read_bytes(&mut buf)?;
            buf.truncate(read);
            Ok(buf)
        })
        .await
    }

    /// Returns the number of bytes readable without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) on device failure.
    pub async fn bytes_available(&self) -> Result<usize> {
        self.exclusive(|resource| resource.bytes_available()).await
    }

    /// Returns `true` until the resource has been closed.
    pub async fn is_open(&self) -> bool {
        self.resource.lock().await.is_open()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::resource::key::SerialParams;
    use crate::resource::mock::{Loopback, PortLog};

    fn handle(log: &PortLog) -> ResourceHandle<SerialParams, Loopback> {
        ResourceHandle::new(
            ResourceKey::new("COM3", SerialParams::new(9600)),
            Arc::new(AsyncMutex::new(Loopback::new(1, log.clone()))),
        )
    }

    #[tokio::test]
    async fn test_write_then_read_returns_response() {
        let handle = handle(&PortLog::default());

        let response = handle.write_then_read(vec![1, 2, 3], 8).await.unwrap();

        assert_eq!(response, vec![1, 2, 3]);
        assert_eq!(handle.bytes_available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_separate_write_and_read() {
        let handle = handle(&PortLog::default());

        assert_eq!(handle.write_bytes(vec![9, 8, 7]).await.unwrap(), 3);
        assert_eq!(handle.bytes_available().await.unwrap(), 3);
        assert_eq!(handle.read_bytes(2).await.unwrap(), vec![9, 8]);
        assert_eq!(handle.read_bytes(2).await.unwrap(), vec![7]);
        assert!(handle.is_open().await);
    }

    #[tokio::test]
    async fn test_io_error_is_returned() {
        let handle = handle(&PortLog::default());

        let err = handle
            .exclusive(|_| -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no response"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_cycles_never_interleave() {
        let log = PortLog::default();
        let handle = handle(&log);

        let cycles = (0..8u8).map(|holder| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .exclusive(move |port| {
                        port.write_bytes(&[holder])?;
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        let mut buf = [0u8; 1];
                        port.read_bytes(&mut buf)?;
                        Ok(buf[0])
                    })
                    .await
            })
        });

        for (holder, cycle) in cycles.collect::<Vec<_>>().into_iter().enumerate() {
            assert_eq!(cycle.await.unwrap().unwrap(), holder as u8);
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 16);
        for pair in entries.chunks(2) {
            assert!(pair[0].starts_with("write"));
            assert!(pair[1].starts_with("read"));
            assert_eq!(pair[0][5..], pair[1][4..]);
        }
    }
}
