//! Scriptable in-memory transport for connection tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

use super::transport::{LinkEvents, Transport};

type Events = LinkEvents<&'static str, u32>;

#[derive(Default)]
struct ProbeInner {
    open_results: VecDeque<Error>,
    write_results: VecDeque<Error>,
    open_instants: Vec<Instant>,
    closes: usize,
    reads: Vec<&'static str>,
    writes: Vec<(&'static str, u32)>,
    events: Option<Events>,
}

/// Test-side view of a [`MockTransport`]: scripts failures and records calls.
#[derive(Clone, Default)]
pub(crate) struct Probe {
    inner: Arc<Mutex<ProbeInner>>,
}

impl Probe {
    /// Makes the next `open` fail with `error`. Queued failures apply in order.
    pub(crate) fn fail_next_open(&self, error: Error) {
        self.inner.lock().open_results.push_back(error);
    }

    /// Makes the next `write` fail with `error`.
    pub(crate) fn fail_next_write(&self, error: Error) {
        self.inner.lock().write_results.push_back(error);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.inner.lock().open_instants.len()
    }

    pub(crate) fn open_instants(&self) -> Vec<Instant> {
        self.inner.lock().open_instants.clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.inner.lock().closes
    }

    pub(crate) fn reads(&self) -> Vec<&'static str> {
        self.inner.lock().reads.clone()
    }

    pub(crate) fn writes(&self) -> Vec<(&'static str, u32)> {
        self.inner.lock().writes.clone()
    }

    /// Returns the sink of the most recent successful open.
    pub(crate) fn events(&self) -> Events {
        self.inner
            .lock()
            .events
            .clone()
            .expect("transport was never opened")
    }

    /// Reports link loss on the most recent link, if any.
    pub(crate) fn drop_link(&self, reason: &str) {
        let events = self.inner.lock().events.clone();
        if let Some(events) = events {
            events.link_closed(reason);
        }
    }
}

/// Transport whose behaviour is driven by a [`Probe`].
pub(crate) struct MockTransport {
    probe: Probe,
}

impl MockTransport {
    pub(crate) fn new(probe: Probe) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Address = &'static str;
    type Value = u32;

    async fn open(&mut self, events: Events) -> Result<()> {
        let mut inner = self.probe.inner.lock();
        inner.open_instants.push(Instant::now());
        match inner.open_results.pop_front() {
            Some(error) => Err(error),
            None => {
                inner.events = Some(events);
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.probe.inner.lock().closes += 1;
        Ok(())
    }

    async fn write(&mut self, address: &&'static str, value: u32) -> Result<()> {
        let mut inner = self.probe.inner.lock();
        inner.writes.push((*address, value));
        match inner.write_results.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn request_read(&mut self, address: &&'static str) -> Result<()> {
        self.probe.inner.lock().reads.push(*address);
        Ok(())
    }
}
