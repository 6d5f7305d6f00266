//! In-process storage backend and host environment.
//!
//! Used when embedding the sync core outside a browser-like host, and as the
//! standard fixture in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::backend::{NativeArea, StorageBackend};
use crate::error::StorageError;
use crate::host::{
    HostEnvironment, NativeStorageEvent, NativeStorageListener, TeardownEvent, TeardownListener,
};

/// In-memory key-value storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a key. Returns the previous raw value.
    pub fn remove_item(&self, key: &str) -> Option<String> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// In-process host with local and session areas backed by [`MemoryStorage`].
///
/// Events are delivered only when the embedder calls
/// [`InMemoryHost::dispatch_storage_event`] or [`InMemoryHost::fire_teardown`].
pub struct InMemoryHost {
    local: Arc<MemoryStorage>,
    session: Arc<MemoryStorage>,
    storage_listeners: Mutex<Vec<NativeStorageListener>>,
    teardown_listeners: Mutex<HashMap<TeardownEvent, Vec<TeardownListener>>>,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self {
            local: Arc::new(MemoryStorage::new()),
            session: Arc::new(MemoryStorage::new()),
            storage_listeners: Mutex::new(Vec::new()),
            teardown_listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> &Arc<MemoryStorage> {
        &self.local
    }

    pub fn session(&self) -> &Arc<MemoryStorage> {
        &self.session
    }

    /// Deliver a native storage event to every registered listener.
    pub fn dispatch_storage_event(&self, event: &NativeStorageEvent) {
        let listeners = self
            .storage_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Simulate another process writing `new_value` to one of the native areas.
    ///
    /// The area's storage is updated first, then the event is dispatched, which
    /// is the order a sibling tab's write is observed in.
    pub fn external_write(&self, area: NativeArea, key: &str, new_value: Option<&str>) {
        let storage = match area {
            NativeArea::Local => &self.local,
            NativeArea::Session => &self.session,
        };
        match new_value {
            Some(raw) => {
                let _ = storage.set_item(key, raw);
            }
            None => {
                storage.remove_item(key);
            }
        }
        let storage_area: Arc<dyn StorageBackend> = storage.clone();
        self.dispatch_storage_event(&NativeStorageEvent {
            storage_area: Some(storage_area),
            key: Some(key.to_string()),
            new_value: new_value.map(str::to_string),
        });
    }

    /// Fire a lifecycle event.
    pub fn fire_teardown(&self, event: TeardownEvent) {
        let listeners = self
            .teardown_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener();
        }
    }

    pub fn storage_listener_count(&self) -> usize {
        self.storage_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn teardown_listener_count(&self, event: TeardownEvent) -> usize {
        self.teardown_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl HostEnvironment for InMemoryHost {
    fn native_storage(&self, area: NativeArea) -> Option<Arc<dyn StorageBackend>> {
        let storage: Arc<dyn StorageBackend> = match area {
            NativeArea::Local => self.local.clone(),
            NativeArea::Session => self.session.clone(),
        };
        Some(storage)
    }

    fn add_storage_listener(&self, listener: NativeStorageListener) {
        self.storage_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn add_teardown_listener(&self, event: TeardownEvent, listener: TeardownListener) {
        self.teardown_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(listener);
    }
}
