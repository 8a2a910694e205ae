//! Per-address value cache and consumer fan-out.
//!
//! One [`AddressCache`] belongs to one connection. For every address it keeps
//! the last value seen on the bus and the consumers interested in it, in
//! registration order.
//!
//! Consumers are invoked synchronously on the thread that reports the value.
//! The consumer list is copied under the lock and invoked after releasing it,
//! so a consumer may subscribe or unsubscribe from inside its callback. A slow
//! consumer delays the ones registered after it.
//!
//! Deliveries for one address are serialized by a per-address delivery lock
//! (re-entrant, so a callback may touch its own address again). A consumer
//! never sees an older value after a newer one, including the cached value
//! handed to a new subscriber while a fresh value is being fanned out.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

// ============================================================================
// Types
// ============================================================================

/// Callback receiving values for one address.
///
/// `None` means the value is unknown: the link was lost or the transport
/// could not produce a value.
pub type Consumer<V> = Arc<dyn Fn(Option<&V>) + Send + Sync>;

/// What the caller of [`AddressCache::subscribe`] has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First consumer of an address without a value: issue a read request.
    ReadRequired,
    /// The cached value was delivered to the new consumer.
    Delivered,
    /// A read is already outstanding on behalf of an earlier consumer.
    Pending,
}

/// Serializes value delivery for one address.
type DeliveryLock = Arc<ReentrantMutex<()>>;

/// Cache state for one address.
struct Entry<V> {
    /// Last value observed, `None` until one arrives.
    value: Option<V>,
    /// Bumped on every value update.
    version: u64,
    /// Consumers in registration order.
    consumers: Vec<Consumer<V>>,
    /// Subscription sequence number of the first consumer.
    first_seen: u64,
    delivery: DeliveryLock,
}

struct Inner<A, V> {
    entries: FxHashMap<A, Entry<V>>,
    next_seq: u64,
}

// ============================================================================
// AddressCache
// ============================================================================

/// Last-value cache with ordered consumer fan-out.
pub struct AddressCache<A, V> {
    inner: Mutex<Inner<A, V>>,
}

impl<A, V> Default for AddressCache<A, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: FxHashMap::default(),
                next_seq: 0,
            }),
        }
    }
}

impl<A, V> fmt::Debug for AddressCache<A, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressCache")
            .field("addresses", &self.inner.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl<A, V> AddressCache<A, V>
where
    A: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `consumer` for `address`.
    ///
    /// If a value is cached it is delivered to `consumer` before this returns.
    pub fn subscribe(&self, address: A, consumer: Consumer<V>) -> SubscribeOutcome {
        let (delivery, version) = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let entry = inner.entries.entry(address.clone()).or_insert_with(|| Entry {
                value: None,
                version: 0,
                consumers: Vec::new(),
                first_seen: seq,
                delivery: DeliveryLock::default(),
            });

            let first = entry.consumers.is_empty();
            entry.consumers.push(Arc::clone(&consumer));

            match &entry.value {
                Some(_) => (Arc::clone(&entry.delivery), entry.version),
                None if first => {
                    entry.first_seen = seq;
                    trace!(?address, "First consumer, read required");
                    return SubscribeOutcome::ReadRequired;
                }
                None => return SubscribeOutcome::Pending,
            }
        };

        let _sequence = delivery.lock();
        // A changed version means a fan-out that already included `consumer`
        // has run in between.
        let cached = {
            let inner = self.inner.lock();
            inner
                .entries
                .get(&address)
                .filter(|entry| entry.version == version)
                .and_then(|entry| entry.value.clone())
        };
        if let Some(value) = cached {
            deliver(&address, &consumer, Some(&value));
        }
        SubscribeOutcome::Delivered
    }

    /// Removes `consumer` from `address`, comparing by identity.
    ///
    /// The cached value survives even when the last consumer leaves.
    /// Returns `false` if the consumer was not registered.
    pub fn unsubscribe(&self, address: &A, consumer: &Consumer<V>) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(address) else {
            return false;
        };

        let Some(position) = entry
            .consumers
            .iter()
            .position(|existing| same_consumer(existing, consumer))
        else {
            return false;
        };

        entry.consumers.remove(position);
        if entry.consumers.is_empty() && entry.value.is_none() {
            inner.entries.remove(address);
        }
        true
    }

    /// Records a value for `address` and fans it out in registration order.
    ///
    /// Values for addresses nobody ever subscribed to are dropped. A panicking
    /// consumer is logged and skipped; the others still receive the value.
    pub fn on_value_received(&self, address: &A, value: Option<V>) {
        let Some(delivery) = self.delivery_lock(address) else {
            trace!(?address, "Value for unmonitored address ignored");
            return;
        };

        let _sequence = delivery.lock();
        let consumers = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(address) else {
                trace!(?address, "Value for unmonitored address ignored");
                return;
            };
            entry.value.clone_from(&value);
            entry.version += 1;
            entry.consumers.clone()
        };

        for consumer in &consumers {
            deliver(address, consumer, value.as_ref());
        }
    }

    /// Delivers `None` to every consumer and forgets all cached values.
    ///
    /// Consumer lists are kept so a reconnect can resume delivery.
    pub fn invalidate_all(&self) {
        let locks: Vec<(A, DeliveryLock)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .map(|(address, entry)| (address.clone(), Arc::clone(&entry.delivery)))
                .collect()
        };

        for (address, delivery) in &locks {
            let _sequence = delivery.lock();
            let consumers = {
                let mut inner = self.inner.lock();
                let Some(entry) = inner.entries.get_mut(address) else {
                    continue;
                };
                entry.value = None;
                entry.version += 1;
                let consumers = entry.consumers.clone();
                if consumers.is_empty() {
                    inner.entries.remove(address);
                    continue;
                }
                consumers
            };

            for consumer in &consumers {
                deliver(address, consumer, None);
            }
        }
    }

    /// Returns the cached value for `address`.
    #[must_use]
    pub fn cached(&self, address: &A) -> Option<V> {
        self.inner
            .lock()
            .entries
            .get(address)
            .and_then(|entry| entry.value.clone())
    }

    /// Returns the number of consumers registered for `address`.
    #[must_use]
    pub fn consumer_count(&self, address: &A) -> usize {
        self.inner
            .lock()
            .entries
            .get(address)
            .map_or(0, |entry| entry.consumers.len())
    }

    /// Returns the number of addresses with consumers or a cached value.
    #[must_use]
    pub fn address_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns the subscription epoch of `address` if it has consumers but no
    /// value.
    ///
    /// The epoch changes when the address loses its entry and a new first
    /// consumer arrives, so a read issued for an earlier epoch does not cover
    /// the current one.
    #[must_use]
    pub fn unresolved_since(&self, address: &A) -> Option<u64> {
        self.inner
            .lock()
            .entries
            .get(address)
            .filter(|entry| entry.value.is_none() && !entry.consumers.is_empty())
            .map(|entry| entry.first_seen)
    }

    fn delivery_lock(&self, address: &A) -> Option<DeliveryLock> {
        self.inner
            .lock()
            .entries
            .get(address)
            .map(|entry| Arc::clone(&entry.delivery))
    }

    /// Addresses that have consumers but no value, oldest subscription first.
    ///
    /// These need a fresh read after a (re)connect.
    #[must_use]
    pub fn unresolved_addresses(&self) -> Vec<A> {
        let inner = self.inner.lock();
        let mut unresolved: Vec<(u64, A)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.value.is_none() && !entry.consumers.is_empty())
            .map(|(address, entry)| (entry.first_seen, address.clone()))
            .collect();
        unresolved.sort_unstable_by_key(|(seq, _)| *seq);
        unresolved.into_iter().map(|(_, address)| address).collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Compares two consumers by allocation, ignoring vtable identity.
#[inline]
pub(crate) fn same_consumer<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}

fn deliver<A: fmt::Debug, V>(address: &A, consumer: &Consumer<V>, value: Option<&V>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| consumer(value))) {
        warn!(
            ?address,
            panic = panic_message(payload.as_ref()),
            "Consumer failed, continuing fan-out"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(&'static str, Option<u32>)>>>;

    fn recorder(name: &'static str, log: &Log) -> Consumer<u32> {
        let log = Arc::clone(log);
        Arc::new(move |value: Option<&u32>| log.lock().push((name, value.copied())))
    }

    #[test]
    fn test_first_subscription_requires_read_once() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();

        assert_eq!(
            cache.subscribe("1/2/3", recorder("c1", &log)),
            SubscribeOutcome::ReadRequired
        );
        assert_eq!(
            cache.subscribe("1/2/3", recorder("c2", &log)),
            SubscribeOutcome::Pending
        );
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_late_subscriber_gets_cached_value() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();

        assert_eq!(
            cache.subscribe("A", recorder("c1", &log)),
            SubscribeOutcome::ReadRequired
        );
        cache.on_value_received(&"A", Some(5));
        assert_eq!(
            cache.subscribe("A", recorder("c2", &log)),
            SubscribeOutcome::Delivered
        );

        assert_eq!(*log.lock(), vec![("c1", Some(5)), ("c2", Some(5))]);
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let cache = AddressCache::<u16, u32>::new();
        let log = Log::default();
        for name in ["a", "b", "c"] {
            cache.subscribe(7, recorder(name, &log));
        }

        cache.on_value_received(&7, Some(1));
        cache.on_value_received(&7, Some(2));

        let names: Vec<_> = log.lock().iter().map(|(n, v)| (*n, *v)).collect();
        assert_eq!(
            names,
            vec![
                ("a", Some(1)),
                ("b", Some(1)),
                ("c", Some(1)),
                ("a", Some(2)),
                ("b", Some(2)),
                ("c", Some(2)),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_keeps_cached_value() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();
        let consumer = recorder("c1", &log);

        cache.subscribe("A", Arc::clone(&consumer));
        cache.on_value_received(&"A", Some(9));
        assert!(cache.unsubscribe(&"A", &consumer));
        assert_eq!(cache.consumer_count(&"A"), 0);
        assert_eq!(cache.cached(&"A"), Some(9));

        // Resubscribing delivers the cached value, no read needed.
        assert_eq!(
            cache.subscribe("A", recorder("c2", &log)),
            SubscribeOutcome::Delivered
        );
        assert_eq!(log.lock().last(), Some(&("c2", Some(9))));
    }

    #[test]
    fn test_unsubscribe_is_identity_based() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();
        let registered = recorder("c1", &log);
        let lookalike = recorder("c1", &log);

        cache.subscribe("A", Arc::clone(&registered));
        assert!(!cache.unsubscribe(&"A", &lookalike));
        assert!(cache.unsubscribe(&"A", &registered));
        assert!(!cache.unsubscribe(&"A", &registered));
    }

    #[test]
    fn test_panicking_consumer_is_isolated() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();

        cache.subscribe("A", recorder("before", &log));
        cache.subscribe("A", Arc::new(|_: Option<&u32>| panic!("translation failed")));
        cache.subscribe("A", recorder("after", &log));

        cache.on_value_received(&"A", Some(3));

        assert_eq!(*log.lock(), vec![("before", Some(3)), ("after", Some(3))]);
        assert_eq!(cache.cached(&"A"), Some(3));
    }

    #[test]
    fn test_error_value_is_cached_as_unknown() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();
        cache.subscribe("A", recorder("c1", &log));
        cache.on_value_received(&"A", Some(1));
        cache.on_value_received(&"A", None);

        assert_eq!(cache.cached(&"A"), None);
        assert_eq!(log.lock().last(), Some(&("c1", None)));
    }

    #[test]
    fn test_invalidate_all_notifies_and_clears_values() {
        let cache = AddressCache::<&str, u32>::new();
        let log = Log::default();
        cache.subscribe("A", recorder("a", &log));
        cache.subscribe("B", recorder("b", &log));
        cache.on_value_received(&"A", Some(1));
        cache.on_value_received(&"B", Some(2));
        log.lock().clear();

        cache.invalidate_all();

        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![("a", None), ("b", None)]);
        assert_eq!(cache.cached(&"A"), None);
        assert_eq!(cache.consumer_count(&"A"), 1);
        assert_eq!(cache.unresolved_addresses(), vec!["A", "B"]);
    }

    #[test]
    fn test_invalidate_drops_unwatched_values() {
        let cache = AddressCache::<&str, u32>::new();
        let consumer: Consumer<u32> = Arc::new(|_: Option<&u32>| {});
        cache.subscribe("A", Arc::clone(&consumer));
        cache.on_value_received(&"A", Some(1));
        cache.unsubscribe(&"A", &consumer);
        assert_eq!(cache.address_count(), 1);

        cache.invalidate_all();
        assert_eq!(cache.address_count(), 0);
    }

    #[test]
    fn test_values_for_unknown_addresses_are_ignored() {
        let cache = AddressCache::<&str, u32>::new();
        cache.on_value_received(&"nobody", Some(1));
        assert_eq!(cache.address_count(), 0);
        assert_eq!(cache.cached(&"nobody"), None);
    }

    #[test]
    fn test_consumer_may_resubscribe_from_callback() {
        let cache = Arc::new(AddressCache::<&str, u32>::new());
        let log = Log::default();

        let inner_cache = Arc::clone(&cache);
        let inner_log = Arc::clone(&log);
        cache.subscribe(
            "A",
            Arc::new(move |value: Option<&u32>| {
                if value == Some(&1) {
                    inner_cache.subscribe("B", recorder("nested", &inner_log));
                }
            }),
        );

        cache.on_value_received(&"A", Some(1));
        assert_eq!(cache.consumer_count(&"B"), 1);
    }

    #[test]
    fn test_late_subscriber_never_sees_older_value() {
        const LAST: u32 = 2_000;

        let cache = AddressCache::<&str, u32>::new();
        cache.subscribe("A", Arc::new(|_: Option<&u32>| {}));
        cache.on_value_received(&"A", Some(0));

        let cache = &cache;
        let seen: Vec<Arc<Mutex<Vec<u32>>>> = std::thread::scope(|scope| {
            scope.spawn(move || {
                for value in 1..=LAST {
                    cache.on_value_received(&"A", Some(value));
                }
            });

            let subscribers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(move || {
                        (0..50)
                            .map(|_| {
                                let seen = Arc::new(Mutex::new(Vec::new()));
                                let sink = Arc::clone(&seen);
                                cache.subscribe(
                                    "A",
                                    Arc::new(move |value: Option<&u32>| {
                                        sink.lock().extend(value.copied());
                                    }),
                                );
                                seen
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            subscribers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        for values in &seen {
            let values = values.lock();
            assert!(values.windows(2).all(|w| w[0] < w[1]), "{values:?}");
            assert_eq!(values.last(), Some(&LAST));
        }
    }

    #[test]
    fn test_unresolved_since_changes_when_entry_is_recreated() {
        let cache = AddressCache::<&str, u32>::new();
        let consumer: Consumer<u32> = Arc::new(|_: Option<&u32>| {});

        cache.subscribe("A", Arc::clone(&consumer));
        let first = cache.unresolved_since(&"A");
        assert!(first.is_some());

        cache.unsubscribe(&"A", &consumer);
        assert_eq!(cache.unresolved_since(&"A"), None);

        cache.subscribe("A", Arc::clone(&consumer));
        let second = cache.unresolved_since(&"A");
        assert!(second.is_some());
        assert_ne!(first, second);

        cache.on_value_received(&"A", Some(1));
        assert_eq!(cache.unresolved_since(&"A"), None);
    }

    #[test]
    fn test_consumer_may_feed_its_own_address() {
        let cache = Arc::new(AddressCache::<&str, u32>::new());
        let log = Log::default();

        let inner_cache = Arc::clone(&cache);
        cache.subscribe(
            "A",
            Arc::new(move |value: Option<&u32>| {
                if value == Some(&1) {
                    inner_cache.on_value_received(&"A", Some(2));
                }
            }),
        );
        cache.subscribe("A", recorder("c2", &log));

        cache.on_value_received(&"A", Some(1));
        assert_eq!(cache.cached(&"A"), Some(2));
        assert!(log.lock().contains(&("c2", Some(2))));
    }

    #[test]
    fn test_unresolved_addresses_in_subscription_order() {
        let cache = AddressCache::<u16, u32>::new();
        for address in [30, 10, 20] {
            cache.subscribe(address, Arc::new(|_: Option<&u32>| {}));
        }
        cache.on_value_received(&10, Some(1));

        assert_eq!(cache.unresolved_addresses(), vec![30, 20]);
    }
}
