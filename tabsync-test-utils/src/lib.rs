//! tabsync Test Utilities
//!
//! Shared test infrastructure for the tabsync workspace:
//! - Fake storage backends (recording, failing, push-capable)
//! - A callback recorder for subscriber assertions
//! - Proptest generators for keys and JSON values

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::time::Instant;

// Re-export core types for convenience
pub use tabsync_core::{
    Backend, BackendCapability, ChangeListener, ChangeSource, ExternalChange, InMemoryHost,
    MemoryStorage, NativeArea, StorageBackend, StorageError, SyncConfig,
};

// ============================================================================
// FAKE BACKENDS
// ============================================================================

/// One `set_item` call seen by a [`RecordingStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub key: String,
    pub value: String,
    pub at: Instant,
}

/// In-memory backend that records every write with its (tokio) timestamp.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    data: RwLock<HashMap<String, String>>,
    writes: Mutex<Vec<RecordedWrite>>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value without recording it, as if it had been persisted earlier.
    pub fn seed(&self, key: &str, value: &str) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn writes_for(&self, key: &str) -> Vec<RecordedWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.key == key)
            .collect()
    }

    pub fn set_count(&self) -> usize {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn last_write(&self) -> Option<RecordedWrite> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl StorageBackend for RecordingStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.seed(key, value);
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedWrite {
                key: key.to_string(),
                value: value.to_string(),
                at: Instant::now(),
            });
        Ok(())
    }
}

/// How a [`FailingStorage`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Reads succeed (empty), writes exceed the quota.
    #[default]
    Quota,
    /// Reads succeed (empty), writes are rejected.
    RejectWrites,
    /// Reads and writes both fail with read/write errors.
    Unreadable,
    /// The backend is gone.
    Unavailable,
}

/// Backend that never stores anything.
#[derive(Debug, Default)]
pub struct FailingStorage {
    mode: FailureMode,
}

impl FailingStorage {
    /// Writes fail with a quota error.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: FailureMode) -> Self {
        Self { mode }
    }

    pub fn unreadable() -> Self {
        Self::with_mode(FailureMode::Unreadable)
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }
}

impl StorageBackend for FailingStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.mode {
            FailureMode::Quota | FailureMode::RejectWrites => Ok(None),
            FailureMode::Unreadable => Err(StorageError::ReadFailed {
                key: key.to_string(),
                reason: "storage disabled".to_string(),
            }),
            FailureMode::Unavailable => Err(StorageError::Unavailable {
                reason: "storage detached".to_string(),
            }),
        }
    }

    fn set_item(&self, key: &str, _value: &str) -> Result<(), StorageError> {
        match self.mode {
            FailureMode::Quota => Err(StorageError::QuotaExceeded {
                key: key.to_string(),
            }),
            FailureMode::RejectWrites | FailureMode::Unreadable => {
                Err(StorageError::WriteFailed {
                    key: key.to_string(),
                    reason: "storage disabled".to_string(),
                })
            }
            FailureMode::Unavailable => Err(StorageError::Unavailable {
                reason: "storage detached".to_string(),
            }),
        }
    }
}

/// Custom backend with push notifications.
///
/// Local `set_item` calls do not notify; use [`PushStorage::remote_write`]
/// to simulate another process writing to the shared storage.
#[derive(Default)]
pub struct PushStorage {
    data: MemoryStorage,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl PushStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `Backend::push(Arc::new(PushStorage::new()))`, keeping
    /// a handle on the concrete storage.
    pub fn backend() -> (Backend, Arc<PushStorage>) {
        let storage = Arc::new(Self::new());
        (Backend::push(storage.clone()), storage)
    }

    /// Deliver `change` to every subscribed listener.
    pub fn broadcast(&self, change: ExternalChange) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(change.clone());
        }
    }

    /// Store `raw` (or delete the key) and notify listeners.
    pub fn remote_write(&self, key: &str, raw: Option<&str>) {
        match raw {
            Some(raw) => {
                let _ = self.data.set_item(key, raw);
                self.broadcast(ExternalChange::set(key, raw));
            }
            None => {
                self.data.remove_item(key);
                self.broadcast(ExternalChange::removed(key));
            }
        }
    }

    /// Drop every key and notify listeners of the clear.
    pub fn remote_clear(&self) {
        self.data.clear();
        self.broadcast(ExternalChange::cleared());
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl StorageBackend for PushStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.data.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data.set_item(key, value)
    }
}

impl ChangeSource for PushStorage {
    fn subscribe(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

// ============================================================================
// CALLBACK RECORDING
// ============================================================================

/// Records every value a subscriber callback receives.
#[derive(Debug, Clone, Default)]
pub struct CallbackLog {
    seen: Arc<Mutex<Vec<Option<Value>>>>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback appending to this log.
    pub fn callback(&self) -> impl Fn(Option<&Value>) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |value: Option<&Value>| {
            seen.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value.cloned())
        }
    }

    pub fn values(&self) -> Vec<Option<Value>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn last(&self) -> Option<Option<Value>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Non-empty storage key.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}"
    }

    /// Scalar JSON values. Integers only, so text round trips are exact.
    pub fn arb_json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::String),
        ]
    }

    /// Arbitrary JSON documents, nested up to a few levels.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        arb_json_leaf().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6).prop_map(|entries| {
                    Value::Object(entries.into_iter().collect::<Map<String, Value>>())
                }),
            ]
        })
    }

    /// A cached value: present JSON, or the absent marker.
    pub fn arb_stored_value() -> impl Strategy<Value = Option<Value>> {
        prop::option::of(arb_json_value())
    }
}
