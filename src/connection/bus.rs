//! Reconnecting bus connection and its event loop.
//!
//! A [`BusConnection`] owns one logical link to an endpoint. It spawns a
//! tokio task that owns the [`Transport`] and performs every state
//! transition, so transitions are totally ordered and status observers are
//! called synchronously, one transition at a time.
//!
//! # Event Loop
//!
//! The task handles:
//!
//! - `connect` / `disconnect` requests from the API
//! - queued writes and read requests
//! - reconnect timers (one outstanding at a time)
//! - link loss reported by the transport
//!
//! Subscriptions and value fan-out do not go through the loop: they run on
//! the caller's thread against the shared [`AddressCache`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::identifiers::{ConnectionId, EndpointKey};

use super::backoff::{Backoff, BackoffConfig, RetryScheduler};
use super::builder::BusConnectionBuilder;
use super::cache::{AddressCache, Consumer, SubscribeOutcome, panic_message, same_consumer};
use super::state::ConnectionState;
use super::transport::{LinkEvents, Transport};

// ============================================================================
// Types
// ============================================================================

/// Callback notified of every state transition.
pub type StatusObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Requests handled by the event loop.
pub(crate) enum Command<A, V> {
    /// Start connecting unless already connected or connecting.
    Connect { done: oneshot::Sender<()> },
    /// Tear the link down and stay disconnected.
    Disconnect { done: oneshot::Sender<()> },
    /// Write a value.
    Send { address: A, value: V },
    /// Request the current value of an address.
    Read { address: A },
    /// The reconnect timer expired.
    RetryFired,
    /// The transport lost link `generation`.
    LinkLost { generation: u64, reason: String },
    /// Disconnect and stop the loop.
    Shutdown { done: oneshot::Sender<()> },
}

/// State shared between the handles and the event loop.
struct Shared<A, V> {
    /// Unique id for logs.
    id: ConnectionId,
    /// Endpoint this connection talks to.
    endpoint: EndpointKey,
    /// Current state; also feeds `state_changes()`.
    state: watch::Sender<ConnectionState>,
    /// Status observers in registration order.
    observers: Mutex<Vec<StatusObserver>>,
    /// Last values and consumers.
    cache: Arc<AddressCache<A, V>>,
    /// Generation of the open link, 0 when none.
    active_generation: Arc<AtomicU64>,
    /// Delay the next reconnect will use, in milliseconds.
    reconnect_delay_ms: AtomicU64,
}

// ============================================================================
// BusConnection
// ============================================================================

/// Reconnecting connection to one endpoint.
///
/// Cloning yields another handle to the same connection. The event loop
/// stops on [`shutdown`](Self::shutdown) or when the last handle is dropped.
///
/// # Example
///
/// ```ignore
/// let connection = BusConnection::builder()
///     .endpoint("10.0.0.5:3671/tunnelling")
///     .transport(KnxTunnel::new(settings))
///     .build()?;
///
/// connection.add_status_observer(Arc::new(|state: ConnectionState| println!("{state}")));
/// connection.subscribe(GroupAddress::new(1, 2, 3), Arc::new(|value: Option<&Dpt>| {
///     println!("1/2/3 = {value:?}");
/// }));
/// connection.connect().await;
/// ```
pub struct BusConnection<T: Transport> {
    /// Shared state.
    shared: Arc<Shared<T::Address, T::Value>>,
    /// Channel to the event loop.
    command_tx: mpsc::UnboundedSender<Command<T::Address, T::Value>>,
}

impl<T: Transport> Clone for BusConnection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            command_tx: self.command_tx.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for BusConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BusConnection - Constructor
// ============================================================================

impl<T: Transport> BusConnection<T> {
    /// Creates a builder for a connection.
    #[inline]
    #[must_use]
    pub fn builder() -> BusConnectionBuilder<T> {
        BusConnectionBuilder::new()
    }

    /// Creates the connection and spawns its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(endpoint: EndpointKey, transport: T, backoff: BackoffConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            id: ConnectionId::next(),
            endpoint,
            state,
            observers: Mutex::new(Vec::new()),
            cache: Arc::new(AddressCache::new()),
            active_generation: Arc::new(AtomicU64::new(0)),
            reconnect_delay_ms: AtomicU64::new(backoff.initial_delay_ms),
        });

        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            transport,
            command_tx: command_tx.downgrade(),
            backoff: Backoff::new(backoff),
            retry: RetryScheduler::default(),
            generation: 0,
            link_open: false,
            requested: FxHashMap::default(),
        };

        debug!(id = %shared.id, endpoint = %shared.endpoint, "Bus connection created");
        tokio::spawn(event_loop.run(command_rx));

        Self { shared, command_tx }
    }
}

// ============================================================================
// BusConnection - Accessors
// ============================================================================

impl<T: Transport> BusConnection<T> {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Returns the endpoint key.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &EndpointKey {
        &self.shared.endpoint
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Returns `true` if the link is up.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns a receiver that observes every state change.
    ///
    /// Unlike status observers, a slow receiver may skip intermediate states.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns the delay the next reconnect attempt will wait.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.shared.reconnect_delay_ms.load(Ordering::Relaxed))
    }

    /// Returns the cached value of `address`.
    #[must_use]
    pub fn cached(&self, address: &T::Address) -> Option<T::Value> {
        self.shared.cache.cached(address)
    }

    /// Returns the number of consumers registered for `address`.
    #[must_use]
    pub fn consumer_count(&self, address: &T::Address) -> usize {
        self.shared.cache.consumer_count(address)
    }
}

// ============================================================================
// BusConnection - Lifecycle
// ============================================================================

impl<T: Transport> BusConnection<T> {
    /// Starts connecting.
    ///
    /// Returns once the attempt has settled: the state is then `Connected`,
    /// `Waiting` (a retry is scheduled) or `Error` (permanent failure). A
    /// no-op while connected or connecting.
    pub async fn connect(&self) {
        self.request(|done| Command::Connect { done }).await;
    }

    /// Closes the link and cancels any pending reconnect.
    ///
    /// A no-op while disconnected or disconnecting.
    pub async fn disconnect(&self) {
        self.request(|done| Command::Disconnect { done }).await;
    }

    /// Disconnects and stops the event loop.
    ///
    /// Later calls on any handle are logged no-ops.
    pub async fn shutdown(&self) {
        self.request(|done| Command::Shutdown { done }).await;
    }

    /// Sends a request to the event loop and waits until it is handled.
    async fn request<F>(&self, make: F)
    where
        F: FnOnce(oneshot::Sender<()>) -> Command<T::Address, T::Value>,
    {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(make(done_tx)).is_err() {
            debug!(id = %self.shared.id, "Event loop stopped, request ignored");
            return;
        }
        let _ = done_rx.await;
    }
}

// ============================================================================
// BusConnection - Status Observers
// ============================================================================

impl<T: Transport> BusConnection<T> {
    /// Registers a status observer. Adding the same observer twice is a no-op.
    ///
    /// Returns `false` if it was already registered.
    pub fn add_status_observer(&self, observer: StatusObserver) -> bool {
        let mut observers = self.shared.observers.lock();
        if observers.iter().any(|existing| same_consumer(existing, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    /// Removes a status observer, comparing by identity.
    pub fn remove_status_observer(&self, observer: &StatusObserver) -> bool {
        let mut observers = self.shared.observers.lock();
        let before = observers.len();
        observers.retain(|existing| !same_consumer(existing, observer));
        observers.len() != before
    }
}

// ============================================================================
// BusConnection - Data
// ============================================================================

impl<T: Transport> BusConnection<T> {
    /// Registers `consumer` for `address`.
    ///
    /// A cached value is delivered before this returns. The first consumer of
    /// an address without a value triggers a read request, issued now if the
    /// link is up or after the next successful connect otherwise.
    pub fn subscribe(&self, address: T::Address, consumer: Consumer<T::Value>) {
        let outcome = self.shared.cache.subscribe(address.clone(), consumer);
        trace!(id = %self.shared.id, ?address, ?outcome, "Subscribed");

        if outcome == SubscribeOutcome::ReadRequired
            && self.command_tx.send(Command::Read { address }).is_err()
        {
            debug!(id = %self.shared.id, "Event loop stopped, read request dropped");
        }
    }

    /// Removes `consumer` from `address`. The cached value is kept.
    pub fn unsubscribe(&self, address: &T::Address, consumer: &Consumer<T::Value>) -> bool {
        self.shared.cache.unsubscribe(address, consumer)
    }

    /// Writes `value` to `address`.
    ///
    /// Dropped with a log line when not connected. A write the transport
    /// cannot complete counts as link loss and triggers a reconnect; it is
    /// not retried.
    pub fn send(&self, address: T::Address, value: T::Value) {
        let state = self.state();
        if state != ConnectionState::Connected {
            debug!(id = %self.shared.id, ?address, %state, "Not connected, write dropped");
            return;
        }

        if self
            .command_tx
            .send(Command::Send { address, value })
            .is_err()
        {
            debug!(id = %self.shared.id, "Event loop stopped, write dropped");
        }
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// Owner of the transport. Runs as one tokio task per connection.
struct EventLoop<T: Transport> {
    shared: Arc<Shared<T::Address, T::Value>>,
    transport: T,
    /// Weak so that dropping every handle stops the loop.
    command_tx: mpsc::WeakUnboundedSender<Command<T::Address, T::Value>>,
    backoff: Backoff,
    retry: RetryScheduler,
    /// Incremented on every open attempt.
    generation: u64,
    link_open: bool,
    /// Addresses already read on the current link, with the subscription
    /// epoch each read was issued for.
    requested: FxHashMap<T::Address, u64>,
}

impl<T: Transport> EventLoop<T> {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command<T::Address, T::Value>>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Connect { done } => {
                    self.connect().await;
                    let _ = done.send(());
                }

                Command::Disconnect { done } => {
                    self.disconnect().await;
                    let _ = done.send(());
                }

                Command::Send { address, value } => {
                    self.write(address, value).await;
                }

                Command::Read { address } => {
                    self.read(address).await;
                }

                Command::RetryFired => {
                    self.retry.fired();
                    let state = self.state();
                    if state == ConnectionState::Waiting {
                        debug!(id = %self.shared.id, "Reconnecting");
                        self.connect().await;
                    } else {
                        trace!(id = %self.shared.id, %state, "Retry fired, nothing to do");
                    }
                }

                Command::LinkLost { generation, reason } => {
                    if self.link_open && generation == self.generation {
                        self.link_lost(&reason).await;
                    } else {
                        trace!(id = %self.shared.id, generation, "Stale link event ignored");
                    }
                }

                Command::Shutdown { done } => {
                    self.disconnect().await;
                    let _ = done.send(());
                    break;
                }
            }
        }

        self.retry.cancel();
        if self.link_open {
            self.close_link().await;
        }
        debug!(id = %self.shared.id, "Event loop terminated");
    }

    #[inline]
    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Applies a transition and notifies observers in order.
    fn transition(&self, next: ConnectionState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        debug_assert!(
            previous.can_transition_to(next),
            "illegal transition {previous} -> {next}"
        );

        self.shared.state.send_replace(next);
        debug!(id = %self.shared.id, endpoint = %self.shared.endpoint, from = %previous, to = %next, "State changed");

        let observers = self.shared.observers.lock().clone();
        for observer in &observers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(next))) {
                warn!(
                    id = %self.shared.id,
                    state = %next,
                    panic = panic_message(payload.as_ref()),
                    "Status observer failed"
                );
            }
        }
    }

    async fn connect(&mut self) {
        let state = self.state();
        if !state.accepts_connect() {
            trace!(id = %self.shared.id, %state, "Connect ignored");
            return;
        }

        self.transition(ConnectionState::Connecting);
        self.generation += 1;

        let events = LinkEvents::new(
            self.generation,
            Arc::clone(&self.shared.active_generation),
            Arc::clone(&self.shared.cache),
            self.command_tx.clone(),
        );

        match self.transport.open(events).await {
            Ok(()) => {
                self.link_open = true;
                self.shared
                    .active_generation
                    .store(self.generation, Ordering::Release);
                self.retry.cancel();
                self.backoff.reset();
                self.publish_delay();
                self.requested.clear();

                info!(id = %self.shared.id, endpoint = %self.shared.endpoint, "Connected");
                self.transition(ConnectionState::Connected);
                self.resync().await;
            }
            Err(e) if e.is_permanent() => {
                warn!(id = %self.shared.id, endpoint = %self.shared.endpoint, error = %e, "Connection configuration rejected, not retrying");
                self.transition(ConnectionState::Error);
            }
            Err(e) => {
                info!(id = %self.shared.id, endpoint = %self.shared.endpoint, error = %e, "Connection attempt failed");
                self.transition(ConnectionState::Waiting);
                self.schedule_retry();
            }
        }
    }

    async fn disconnect(&mut self) {
        let state = self.state();
        if !state.accepts_disconnect() {
            trace!(id = %self.shared.id, %state, "Disconnect ignored");
            return;
        }

        self.transition(ConnectionState::Disconnecting);
        self.retry.cancel();
        if self.link_open {
            self.close_link().await;
        }
        self.shared.cache.invalidate_all();
        self.transition(ConnectionState::Disconnected);
    }

    async fn link_lost(&mut self, reason: &str) {
        info!(id = %self.shared.id, endpoint = %self.shared.endpoint, %reason, "Link lost");

        self.close_link().await;
        self.shared.cache.invalidate_all();
        self.transition(ConnectionState::Error);
        self.transition(ConnectionState::Waiting);
        self.schedule_retry();
    }

    async fn close_link(&mut self) {
        self.link_open = false;
        self.shared.active_generation.store(0, Ordering::Release);
        if let Err(e) = self.transport.close().await {
            debug!(id = %self.shared.id, error = %e, "Transport close failed");
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_pending() {
            trace!(id = %self.shared.id, "Retry already pending");
            return;
        }

        let delay = self.backoff.next_delay();
        self.publish_delay();

        let command_tx = self.command_tx.clone();
        self.retry.schedule(delay, move || {
            if let Some(tx) = command_tx.upgrade() {
                let _ = tx.send(Command::RetryFired);
            }
        });

        debug!(id = %self.shared.id, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Reconnect scheduled");
    }

    fn publish_delay(&self) {
        let delay_ms = u64::try_from(self.backoff.current().as_millis()).unwrap_or(u64::MAX);
        self.shared
            .reconnect_delay_ms
            .store(delay_ms, Ordering::Relaxed);
    }

    /// Issues reads for every watched address that has no value yet.
    async fn resync(&mut self) {
        for address in self.shared.cache.unresolved_addresses() {
            self.read(address).await;
        }
    }

    async fn read(&mut self, address: T::Address) {
        if !self.link_open {
            trace!(id = %self.shared.id, ?address, "Read deferred until connected");
            return;
        }
        let Some(epoch) = self.shared.cache.unresolved_since(&address) else {
            trace!(id = %self.shared.id, ?address, "Value known or address unwatched, read skipped");
            return;
        };
        if self.requested.get(&address) == Some(&epoch) {
            trace!(id = %self.shared.id, ?address, "Read already requested on this link");
            return;
        }
        self.requested.insert(address.clone(), epoch);

        debug!(id = %self.shared.id, ?address, "Requesting current value");
        if let Err(e) = self.transport.request_read(&address).await {
            info!(id = %self.shared.id, ?address, error = %e, "Read request failed");
        }
    }

    async fn write(&mut self, address: T::Address, value: T::Value) {
        if !self.link_open {
            debug!(id = %self.shared.id, ?address, "Link down, write dropped");
            return;
        }

        trace!(id = %self.shared.id, ?address, "Writing");
        if let Err(e) = self.transport.write(&address, value).await {
            warn!(id = %self.shared.id, ?address, error = %e, "Write failed");
            self.link_lost(&e.to_string()).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
