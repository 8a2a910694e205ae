//! In-memory serial ports for resource manager tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::factory::{PhysicalResource, ResourceFactory};
use super::key::SerialParams;

/// Ordered record of port operations, shared by every port of a factory.
#[derive(Clone, Default)]
pub(crate) struct PortLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl PortLog {
    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Blocks port closes until released, to keep a close pending.
#[derive(Default)]
struct CloseGate {
    held: Mutex<bool>,
    released: Condvar,
}

impl CloseGate {
    fn wait(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }
}

/// A port that echoes written bytes back to the reader.
pub(crate) struct Loopback {
    id: usize,
    log: PortLog,
    rx: VecDeque<u8>,
    open: bool,
    gate: Option<Arc<CloseGate>>,
}

impl Loopback {
    pub(crate) fn new(id: usize, log: PortLog) -> Self {
        Self {
            id,
            log,
            rx: VecDeque::new(),
            open: true,
            gate: None,
        }
    }
}

impl PhysicalResource for Loopback {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        self.log.push(format!("write{data:?}"));
        self.rx.extend(data);
        Ok(data.len())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        let read = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..read)) {
            *slot = byte;
        }
        self.log.push(format!("read{:?}", &buf[..read]));
        Ok(read)
    }

    fn bytes_available(&self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.open = false;
        self.log.push(format!("close#{}", self.id));
        Ok(())
    }
}

/// Factory of [`Loopback`] ports with open/close accounting.
#[derive(Default)]
pub(crate) struct LoopbackFactory {
    opens: AtomicUsize,
    failing: Mutex<Vec<String>>,
    open_delay: Mutex<Duration>,
    gate: Arc<CloseGate>,
    log: PortLog,
}

impl LoopbackFactory {
    /// Makes every open of `descriptor` fail.
    pub(crate) fn fail_opens_of(&self, descriptor: &str) {
        self.failing.lock().push(descriptor.to_string());
    }

    /// Makes every later open block for `delay` before succeeding.
    pub(crate) fn delay_opens(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Keeps closes blocked until [`release_closes`](Self::release_closes).
    pub(crate) fn hold_closes(&self) {
        *self.gate.held.lock() = true;
    }

    pub(crate) fn release_closes(&self) {
        *self.gate.held.lock() = false;
        self.gate.released.notify_all();
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.log
            .entries()
            .iter()
            .filter(|entry| entry.starts_with("close"))
            .count()
    }

    pub(crate) fn log(&self) -> &PortLog {
        &self.log
    }
}

impl ResourceFactory for LoopbackFactory {
    type Params = SerialParams;
    type Resource = Loopback;

    fn open(&self, descriptor: &str, _params: &SerialParams) -> io::Result<Loopback> {
        if self.failing.lock().iter().any(|d| d == descriptor) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let id = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push(format!("open#{id}"));

        let mut port = Loopback::new(id, self.log.clone());
        port.gate = Some(Arc::clone(&self.gate));
        Ok(port)
    }
}
