//! Reactive data store.
//!
//! Holds the latest known value per (backend, key), the subscription
//! registry, and the fan-out that keeps subscribers in step with local writes
//! and external change notifications.
//!
//! # Invariants
//!
//! 1. Once initialized, a cache entry reflects the most recent value from a
//!    local broadcast or an external change.
//! 2. Subscribers of a pair are invoked in registration order.
//! 3. Broadcast is an event: the same value broadcast twice notifies twice.
//! 4. The cache is ref-counted by subscribers: the last unsubscribe for a pair
//!    evicts its entry.
//! 5. No internal lock is held while a callback or a backend runs, so
//!    callbacks may re-enter the store.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tabsync_core::{Backend, HostEnvironment, SubscriptionError, SyncResult};
use tracing::{debug, error, warn};

use crate::bridge::BridgeState;
use crate::identity::{BackendRegistry, CacheKey};
use crate::writer::DebouncedWriter;

/// Subscriber callback. Receives the new value, or `None` for the absent marker.
pub type Callback = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

/// Identifier returned by [`DataStore::subscribe`]. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a broadcast value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written by this process; persisted before fan-out.
    Local,
    /// Observed from outside this process; already persisted by its writer.
    External,
}

struct Subscription {
    id: SubscriptionId,
    cache_key: CacheKey,
    callback: Callback,
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<CacheKey, Option<Value>>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

pub(crate) struct StoreShared {
    registry: Arc<BackendRegistry>,
    writer: DebouncedWriter,
    host: Option<Arc<dyn HostEnvironment>>,
    bridge: BridgeState,
    state: Mutex<StoreState>,
}

/// Process-wide cache with pub/sub fan-out.
///
/// Cloning shares the same cache and subscriptions.
#[derive(Clone)]
pub struct DataStore {
    shared: Arc<StoreShared>,
}

/// Non-owning reference held by change listeners.
#[derive(Clone)]
pub(crate) struct WeakDataStore(Weak<StoreShared>);

impl WeakDataStore {
    pub(crate) fn upgrade(&self) -> Option<DataStore> {
        self.0.upgrade().map(|shared| DataStore { shared })
    }
}

impl DataStore {
    pub fn new(
        registry: Arc<BackendRegistry>,
        writer: DebouncedWriter,
        host: Option<Arc<dyn HostEnvironment>>,
    ) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                registry,
                writer,
                host,
                bridge: BridgeState::default(),
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> WeakDataStore {
        WeakDataStore(Arc::downgrade(&self.shared))
    }

    pub(crate) fn host(&self) -> Option<&Arc<dyn HostEnvironment>> {
        self.shared.host.as_ref()
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.shared.registry
    }

    pub fn writer(&self) -> &DebouncedWriter {
        &self.shared.writer
    }

    /// Seed the cache for a pair from the backend, or from `default`.
    ///
    /// Returns `true` only when the backend had no value and `default` was
    /// used; the caller is then expected to publish the default so it is
    /// persisted and broadcast. A pair whose cached value is present is left
    /// untouched. Unreadable or undecodable stored values seed JSON `null`.
    pub fn initialize(&self, backend: &Backend, key: &str, default: Option<Value>) -> bool {
        self.initialize_with(backend, key, || default)
    }

    /// Like [`DataStore::initialize`], building the default only when the
    /// backend has no value.
    pub fn initialize_with<D>(&self, backend: &Backend, key: &str, default: D) -> bool
    where
        D: FnOnce() -> Option<Value>,
    {
        let cache_key = self.shared.registry.cache_key(backend, key);
        if self.has_value(&cache_key) {
            return false;
        }

        let (seed, defaulted) = match backend.load(key) {
            Ok(None) => (default(), true),
            Ok(Some(value)) => (Some(value), false),
            Err(e) => {
                error!(cache_key = %cache_key, error = %e, "Failed to load stored value");
                (Some(Value::Null), false)
            }
        };

        let mut state = self.lock();
        if state.cache.get(&cache_key).is_some_and(Option::is_some) {
            return false;
        }
        debug!(cache_key = %cache_key, defaulted, "Initialized cache entry");
        state.cache.insert(cache_key, seed);
        defaulted
    }

    /// Cached value for a pair. Never touches the backend.
    pub fn read(&self, backend: &Backend, key: &str) -> Option<Value> {
        let cache_key = self.shared.registry.cache_key(backend, key);
        self.lock().cache.get(&cache_key).cloned().flatten()
    }

    /// Overwrite the cached value without persisting or notifying.
    pub fn write(&self, backend: &Backend, key: &str, value: Option<Value>) {
        let cache_key = self.shared.registry.cache_key(backend, key);
        self.lock().cache.insert(cache_key, value);
    }

    /// Update the cache, persist local changes, and notify subscribers of the pair.
    ///
    /// Local changes go through the debounced writer with `hysteresis` as the
    /// delay (`None` persists now). External changes are never re-persisted.
    pub fn broadcast_change(
        &self,
        backend: &Backend,
        key: &str,
        value: Option<Value>,
        hysteresis: Option<Duration>,
        origin: ChangeOrigin,
    ) {
        let cache_key = self.shared.registry.cache_key(backend, key);
        self.lock().cache.insert(cache_key.clone(), value.clone());

        if origin == ChangeOrigin::Local {
            self.shared
                .writer
                .schedule(backend, key, value.clone(), hysteresis);
        }

        let callbacks: Vec<Callback> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.cache_key == cache_key)
            .map(|s| s.callback.clone())
            .collect();

        debug!(
            cache_key = %cache_key,
            ?origin,
            subscribers = callbacks.len(),
            "Broadcast change"
        );
        notify(&callbacks, value.as_ref());
    }

    /// Notify every subscriber of `backend` that all of its keys were cleared.
    ///
    /// Each subscriber receives the absent marker. The cache is left as is.
    pub fn broadcast_clear(&self, backend: &Backend) {
        let backend_id = self.shared.registry.id_of(backend);
        let callbacks: Vec<Callback> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.cache_key.backend == backend_id)
            .map(|s| s.callback.clone())
            .collect();

        debug!(
            backend = %backend_id,
            subscribers = callbacks.len(),
            "Broadcast clear"
        );
        notify(&callbacks, None);
    }

    /// Register `callback` for a pair.
    ///
    /// The first subscription against an observable backend attaches the
    /// external change bridge for it.
    pub fn subscribe<F>(&self, backend: &Backend, key: &str, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.shared.bridge.attach(self, backend);

        let cache_key = self.shared.registry.cache_key(backend, key);
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        debug!(cache_key = %cache_key, subscription = %id, "Subscribed");
        state.subscriptions.push(Subscription {
            id,
            cache_key,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a subscription, evicting its cache entry if it was the last one
    /// for its pair.
    ///
    /// An unknown id changes nothing and is reported as
    /// [`SubscriptionError::Unknown`].
    pub fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<()> {
        let removed = {
            let mut state = self.lock();
            let Some(index) = state.subscriptions.iter().position(|s| s.id == id) else {
                drop(state);
                warn!(subscription = %id, "Unsubscribe for unknown subscription");
                return Err(SubscriptionError::Unknown { id: id.0 }.into());
            };
            let removed = state.subscriptions.remove(index);
            let still_watched = state
                .subscriptions
                .iter()
                .any(|s| s.cache_key == removed.cache_key);
            if !still_watched {
                state.cache.remove(&removed.cache_key);
                debug!(cache_key = %removed.cache_key, "Evicted cache entry");
            }
            removed
        };
        debug!(subscription = %removed.id, "Unsubscribed");
        Ok(())
    }

    /// Whether the pair has a cache entry (including one holding the absent marker).
    pub fn is_cached(&self, backend: &Backend, key: &str) -> bool {
        let cache_key = self.shared.registry.cache_key(backend, key);
        self.lock().cache.contains_key(&cache_key)
    }

    pub fn subscriber_count(&self, backend: &Backend, key: &str) -> usize {
        let cache_key = self.shared.registry.cache_key(backend, key);
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| s.cache_key == cache_key)
            .count()
    }

    /// Drop every cache entry, subscription and pending write.
    ///
    /// Bridge listeners already installed on backends or on the host stay
    /// installed and keep feeding this store.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.cache.clear();
            state.subscriptions.clear();
        }
        self.shared.writer.reset();
    }

    fn has_value(&self, cache_key: &CacheKey) -> bool {
        self.lock().cache.get(cache_key).is_some_and(Option::is_some)
    }
}

fn notify(callbacks: &[Callback], value: Option<&Value>) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
            error!("Subscriber callback panicked, continuing fan-out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabsync_core::{MemoryStorage, StorageBackend};

    fn store() -> DataStore {
        let registry = Arc::new(BackendRegistry::new());
        let writer = DebouncedWriter::new(registry.clone(), None, true);
        DataStore::new(registry, writer, None)
    }

    fn polling() -> (Backend, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (Backend::polling(storage.clone()), storage)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Option<&Value>) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = hits.clone();
        (hits, move |_: Option<&Value>| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_initialize_seeds_default_when_absent() {
        let store = store();
        let (s, _) = polling();
        let init = json!({"im": "here"});

        assert!(store.initialize(&s, "doesnt-exist", Some(init.clone())));
        assert_eq!(store.read(&s, "doesnt-exist"), Some(init));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = store();
        let (s, _) = polling();

        store.initialize(&s, "k", Some(json!({"im": "here"})));
        assert!(!store.initialize(&s, "k", Some(json!({"im": "not here"}))));
        assert_eq!(store.read(&s, "k"), Some(json!({"im": "here"})));
    }

    #[test]
    fn test_initialize_loads_stored_value() {
        let store = store();
        let (s, storage) = polling();
        storage.set_item("count", "41").unwrap();

        assert!(!store.initialize(&s, "count", Some(json!(0))));
        assert_eq!(store.read(&s, "count"), Some(json!(41)));
    }

    #[test]
    fn test_initialize_stored_null_is_not_absent() {
        let store = store();
        let (s, storage) = polling();
        storage.set_item("k", "null").unwrap();

        assert!(!store.initialize(&s, "k", Some(json!(7))));
        assert_eq!(store.read(&s, "k"), Some(Value::Null));
    }

    #[test]
    fn test_initialize_undecodable_seeds_null() {
        let store = store();
        let (s, storage) = polling();
        storage.set_item("k", "{oops").unwrap();

        assert!(!store.initialize(&s, "k", Some(json!(7))));
        assert_eq!(store.read(&s, "k"), Some(Value::Null));
        assert!(store.is_cached(&s, "k"));
    }

    #[test]
    fn test_initialize_with_builds_default_only_when_absent() {
        let store = store();
        let (s, storage) = polling();
        storage.set_item("stored", "1").unwrap();
        let built = AtomicUsize::new(0);

        assert!(!store.initialize_with(&s, "stored", || {
            built.fetch_add(1, Ordering::SeqCst);
            Some(json!(0))
        }));
        assert_eq!(built.load(Ordering::SeqCst), 0);

        assert!(store.initialize_with(&s, "fresh", || {
            built.fetch_add(1, Ordering::SeqCst);
            Some(json!([1, 2, 3]))
        }));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(store.read(&s, "fresh"), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_read_write_are_namespaced_by_backend() {
        let store = store();
        let (a, _) = polling();
        let (b, _) = polling();

        store.write(&a, "test-key", Some(json!(1234)));
        store.write(&b, "test-key", Some(json!(4321)));

        assert_eq!(store.read(&a, "test-key"), Some(json!(1234)));
        assert_eq!(store.read(&b, "test-key"), Some(json!(4321)));
    }

    #[test]
    fn test_write_does_not_persist() {
        let store = store();
        let (s, storage) = polling();
        store.write(&s, "k", Some(json!(1)));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_broadcast_persists_and_notifies_matching_key_only() {
        let store = store();
        let (s, storage) = polling();
        let (hits1, cb1) = counter();
        let (hits2, cb2) = counter();

        let id1 = store.subscribe(&s, "callback-key1", cb1);
        let id2 = store.subscribe(&s, "callback-key2", cb2);

        store.broadcast_change(&s, "callback-key1", Some(json!("woah")), None, ChangeOrigin::Local);
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 0);
        assert_eq!(
            storage.get_item("callback-key1").unwrap(),
            Some("\"woah\"".to_string())
        );

        store.unsubscribe(id1).unwrap();
        store.unsubscribe(id2).unwrap();
        store.broadcast_change(&s, "callback-key1", Some(json!("woah")), None, ChangeOrigin::Local);
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_same_value_twice_notifies_twice() {
        let store = store();
        let (s, _) = polling();
        let (hits, cb) = counter();
        store.subscribe(&s, "k", cb);

        store.broadcast_change(&s, "k", Some(json!(1)), None, ChangeOrigin::Local);
        store.broadcast_change(&s, "k", Some(json!(1)), None, ChangeOrigin::Local);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribers_invoked_in_registration_order() {
        let store = store();
        let (s, _) = polling();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..4 {
            let order = order.clone();
            store.subscribe(&s, "k", move |_: Option<&Value>| order.lock().unwrap().push(n));
        }

        store.broadcast_change(&s, "k", Some(json!(true)), None, ChangeOrigin::Local);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_external_broadcast_does_not_persist() {
        let store = store();
        let (s, storage) = polling();
        let (hits, cb) = counter();
        store.subscribe(&s, "k", cb);

        store.broadcast_change(&s, "k", Some(json!(3)), None, ChangeOrigin::External);
        assert!(storage.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.read(&s, "k"), Some(json!(3)));
    }

    #[test]
    fn test_broadcast_clear_reaches_every_key_of_backend() {
        let store = store();
        let (s, _) = polling();
        let (other, _) = polling();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for key in ["a", "b"] {
            let seen = seen.clone();
            store.subscribe(&s, key, move |v: Option<&Value>| {
                seen.lock().unwrap().push(v.cloned())
            });
        }
        let (other_hits, other_cb) = counter();
        store.subscribe(&other, "a", other_cb);

        store.write(&s, "a", Some(json!(1)));
        store.broadcast_clear(&s);

        assert_eq!(*seen.lock().unwrap(), vec![None, None]);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
        assert_eq!(store.read(&s, "a"), Some(json!(1)));
    }

    #[test]
    fn test_unsubscribe_last_evicts() {
        let store = store();
        let (s, _) = polling();
        let (hits, cb) = counter();
        let (_, cb2) = counter();
        let first = store.subscribe(&s, "k", cb);
        let second = store.subscribe(&s, "k", cb2);
        store.initialize(&s, "k", Some(json!(0)));

        store.unsubscribe(second).unwrap();
        store.broadcast_change(&s, "k", Some(json!(1)), None, ChangeOrigin::Local);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(store.is_cached(&s, "k"));

        store.unsubscribe(first).unwrap();
        assert!(!store.is_cached(&s, "k"));
    }

    #[test]
    fn test_unsubscribe_unknown_id_is_reported() {
        let store = store();
        let (s, _) = polling();
        let (_, cb) = counter();
        let id = store.subscribe(&s, "k", cb);
        store.unsubscribe(id).unwrap();

        let err = store.unsubscribe(id).unwrap_err();
        assert!(matches!(
            err,
            tabsync_core::SyncError::Subscription(SubscriptionError::Unknown { .. })
        ));
    }

    #[test]
    fn test_subscription_ids_increase() {
        let store = store();
        let (s, _) = polling();
        let a = store.subscribe(&s, "k", |_: Option<&Value>| {});
        let b = store.subscribe(&s, "j", |_: Option<&Value>| {});
        assert!(b > a);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_fan_out() {
        let store = store();
        let (s, _) = polling();
        store.subscribe(&s, "k", |_: Option<&Value>| panic!("subscriber failure"));
        let (hits, cb) = counter();
        store.subscribe(&s, "k", cb);

        store.broadcast_change(&s, "k", Some(json!(1)), None, ChangeOrigin::Local);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_store() {
        let store = store();
        let (s, _) = polling();
        let inner = store.clone();
        let backend = s.clone();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        store.subscribe(&s, "k", move |_: Option<&Value>| {
            *sink.lock().unwrap() = inner.read(&backend, "k");
        });

        store.broadcast_change(&s, "k", Some(json!("x")), None, ChangeOrigin::Local);
        assert_eq!(*observed.lock().unwrap(), Some(json!("x")));
    }

    #[test]
    fn test_reset_clears_everything() {
        let store = store();
        let (s, _) = polling();
        let (hits, cb) = counter();
        store.subscribe(&s, "k", cb);
        store.write(&s, "k", Some(json!(1)));

        store.reset();
        assert!(!store.is_cached(&s, "k"));
        assert_eq!(store.subscriber_count(&s, "k"), 0);
        store.broadcast_change(&s, "k", Some(json!(2)), None, ChangeOrigin::Local);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
