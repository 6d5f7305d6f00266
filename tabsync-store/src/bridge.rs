//! External change bridge.
//!
//! Feeds changes made outside this process (another tab writing to the same
//! shared storage) into the data store as external broadcasts, which update
//! the cache and notify subscribers without persisting again.
//!
//! Native storage areas share one host-wide change event, so a single
//! listener is installed per store no matter how many native areas are in
//! use; it drops events whose origin is not one of the host's two areas.
//! Push-capable custom backends get their own listener, attached once per
//! backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tabsync_core::{
    codec, storage_address, Backend, BackendCapability, ChangeListener, ExternalChange,
    NativeArea, NativeStorageEvent, NativeStorageListener, StorageBackend,
};
use tracing::{debug, error};

use crate::identity::BackendId;
use crate::store::{ChangeOrigin, DataStore, WeakDataStore};

/// Which listeners have been installed for a store.
#[derive(Default)]
pub(crate) struct BridgeState {
    native_installed: AtomicBool,
    attached: Mutex<HashSet<BackendId>>,
}

impl BridgeState {
    /// Install the change listener `backend` needs, if not installed yet.
    pub(crate) fn attach(&self, store: &DataStore, backend: &Backend) {
        match backend.capability() {
            BackendCapability::Polling => {}
            BackendCapability::Native(_) => {
                let Some(host) = store.host() else {
                    debug!("Native backend without a host, no change listener installed");
                    return;
                };
                if self.native_installed.swap(true, Ordering::SeqCst) {
                    return;
                }
                host.add_storage_listener(native_listener(
                    store.downgrade(),
                    host.native_storage(NativeArea::Local),
                    host.native_storage(NativeArea::Session),
                ));
                debug!("Installed native storage listener");
            }
            BackendCapability::Push(source) => {
                let id = store.registry().id_of(backend);
                let first = self
                    .attached
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id);
                if !first {
                    return;
                }
                source.subscribe(push_listener(store.downgrade(), backend.clone()));
                debug!(backend = %id, "Subscribed to push-capable backend");
            }
        }
    }
}

/// Translate one external change into a broadcast.
///
/// - no key: everything in the backend was cleared;
/// - no value: the key was deleted, broadcast the absent marker;
/// - otherwise decode and broadcast. Undecodable values are dropped.
pub fn apply_external_change(store: &DataStore, backend: &Backend, change: ExternalChange) {
    let ExternalChange { key, new_value } = change;
    let Some(key) = key else {
        store.broadcast_clear(backend);
        return;
    };
    let value = match new_value {
        None => None,
        Some(raw) => match codec::decode(&key, &raw) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(key = %key, error = %e, "Failed to parse new value from storage event");
                return;
            }
        },
    };
    store.broadcast_change(backend, &key, value, None, ChangeOrigin::External);
}

fn push_listener(store: WeakDataStore, backend: Backend) -> ChangeListener {
    Arc::new(move |change: ExternalChange| {
        if let Some(store) = store.upgrade() {
            apply_external_change(&store, &backend, change);
        }
    })
}

fn native_listener(
    store: WeakDataStore,
    local: Option<Arc<dyn StorageBackend>>,
    session: Option<Arc<dyn StorageBackend>>,
) -> NativeStorageListener {
    Arc::new(move |event: &NativeStorageEvent| {
        let Some(origin) = event.storage_area.as_ref() else {
            return;
        };
        let matches = |area: &Option<Arc<dyn StorageBackend>>| {
            area.as_ref()
                .is_some_and(|a| storage_address(a) == storage_address(origin))
        };
        let area = if matches(&local) {
            NativeArea::Local
        } else if matches(&session) {
            NativeArea::Session
        } else {
            debug!("Ignoring storage event from unrecognized storage area");
            return;
        };
        let Some(store) = store.upgrade() else {
            return;
        };
        let backend = Backend::native(area, origin.clone());
        apply_external_change(
            &store,
            &backend,
            ExternalChange {
                key: event.key.clone(),
                new_value: event.new_value.clone(),
            },
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BackendRegistry;
    use crate::writer::DebouncedWriter;
    use serde_json::{json, Value};
    use tabsync_core::{HostEnvironment, InMemoryHost, MemoryStorage};

    fn store_with_host(host: Arc<InMemoryHost>) -> DataStore {
        let registry = Arc::new(BackendRegistry::new());
        let host: Arc<dyn HostEnvironment> = host;
        let writer = DebouncedWriter::new(registry.clone(), Some(host.clone()), true);
        DataStore::new(registry, writer, Some(host))
    }

    fn recorder(store: &DataStore, backend: &Backend, key: &str) -> Arc<Mutex<Vec<Option<Value>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(backend, key, move |v: Option<&Value>| {
            sink.lock().unwrap().push(v.cloned())
        });
        seen
    }

    #[test]
    fn test_apply_set_decodes_and_broadcasts() {
        let host = Arc::new(InMemoryHost::new());
        let store = store_with_host(host);
        let backend = Backend::polling(Arc::new(MemoryStorage::new()));
        let seen = recorder(&store, &backend, "k");

        apply_external_change(&store, &backend, ExternalChange::set("k", r#"{"a":1}"#));
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({"a": 1}))]);
        assert_eq!(store.read(&backend, "k"), Some(json!({"a": 1})));
    }

    #[test]
    fn test_apply_removed_broadcasts_absent_once() {
        let store = store_with_host(Arc::new(InMemoryHost::new()));
        let backend = Backend::polling(Arc::new(MemoryStorage::new()));
        let seen = recorder(&store, &backend, "k");
        store.write(&backend, "k", Some(json!(1)));

        apply_external_change(&store, &backend, ExternalChange::removed("k"));
        assert_eq!(*seen.lock().unwrap(), vec![None]);
        assert_eq!(store.read(&backend, "k"), None);
    }

    #[test]
    fn test_apply_undecodable_is_dropped() {
        let store = store_with_host(Arc::new(InMemoryHost::new()));
        let backend = Backend::polling(Arc::new(MemoryStorage::new()));
        let seen = recorder(&store, &backend, "k");
        store.write(&backend, "k", Some(json!(1)));

        apply_external_change(&store, &backend, ExternalChange::set("k", "not json"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(store.read(&backend, "k"), Some(json!(1)));
    }

    #[test]
    fn test_native_listener_installed_once_for_both_areas() {
        let host = Arc::new(InMemoryHost::new());
        let store = store_with_host(host.clone());
        let local = Backend::native(NativeArea::Local, host.local().clone());
        let session = Backend::native(NativeArea::Session, host.session().clone());

        store.subscribe(&local, "a", |_: Option<&Value>| {});
        store.subscribe(&local, "b", |_: Option<&Value>| {});
        store.subscribe(&session, "a", |_: Option<&Value>| {});
        assert_eq!(host.storage_listener_count(), 1);
    }

    #[test]
    fn test_native_event_reaches_matching_area_only() {
        let host = Arc::new(InMemoryHost::new());
        let store = store_with_host(host.clone());
        let local = Backend::native(NativeArea::Local, host.local().clone());
        let session = Backend::native(NativeArea::Session, host.session().clone());
        let local_seen = recorder(&store, &local, "count");
        let session_seen = recorder(&store, &session, "count");

        host.external_write(NativeArea::Local, "count", Some("3"));
        assert_eq!(*local_seen.lock().unwrap(), vec![Some(json!(3))]);
        assert!(session_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_native_event_from_unknown_origin_is_ignored() {
        let host = Arc::new(InMemoryHost::new());
        let store = store_with_host(host.clone());
        let local = Backend::native(NativeArea::Local, host.local().clone());
        let seen = recorder(&store, &local, "count");

        let stranger: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        host.dispatch_storage_event(&NativeStorageEvent {
            storage_area: Some(stranger),
            key: Some("count".to_string()),
            new_value: Some("9".to_string()),
        });
        host.dispatch_storage_event(&NativeStorageEvent {
            storage_area: None,
            key: Some("count".to_string()),
            new_value: Some("9".to_string()),
        });
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_native_clear_event_broadcasts_absent() {
        let host = Arc::new(InMemoryHost::new());
        let store = store_with_host(host.clone());
        let local = Backend::native(NativeArea::Local, host.local().clone());
        let seen = recorder(&store, &local, "a");

        let area: Arc<dyn StorageBackend> = host.local().clone();
        host.dispatch_storage_event(&NativeStorageEvent {
            storage_area: Some(area),
            key: None,
            new_value: None,
        });
        assert_eq!(*seen.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_native_event_does_not_persist() {
        let host = Arc::new(InMemoryHost::new());
        let store = store_with_host(host.clone());
        let local = Backend::native(NativeArea::Local, host.local().clone());
        recorder(&store, &local, "k");

        let area: Arc<dyn StorageBackend> = host.local().clone();
        host.dispatch_storage_event(&NativeStorageEvent {
            storage_area: Some(area),
            key: Some("k".to_string()),
            new_value: Some("5".to_string()),
        });
        assert_eq!(store.read(&local, "k"), Some(json!(5)));
        assert!(host.local().is_empty());
    }
}
