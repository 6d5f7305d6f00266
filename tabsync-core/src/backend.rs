//! Storage backend traits and capability descriptor.
//!
//! A backend is an opaque key-value capability supplied by the caller. Two
//! backends are the same backend only if they are the same allocation: the
//! same key name in two distinct backends denotes two independent entries.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::codec;
use crate::error::{StorageError, SyncResult};

/// Key-value storage of JSON text.
pub trait StorageBackend: Send + Sync {
    /// Read the raw text stored under `key`, or `None` if the key is absent.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store raw text under `key`.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// A change observed outside this process.
///
/// `key == None` means every key of the backend was cleared.
/// `new_value == None` means the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    pub key: Option<String>,
    pub new_value: Option<String>,
}

impl ExternalChange {
    pub fn set(key: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            new_value: Some(raw.into()),
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            new_value: None,
        }
    }

    pub fn cleared() -> Self {
        Self {
            key: None,
            new_value: None,
        }
    }
}

/// Listener installed on a push-capable backend.
pub type ChangeListener = Arc<dyn Fn(ExternalChange) + Send + Sync>;

/// Push notification capability of a custom backend.
pub trait ChangeSource: Send + Sync {
    /// Register a listener invoked for every write made anywhere in the
    /// environment.
    fn subscribe(&self, listener: ChangeListener);
}

/// The two storage areas a host environment provides natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeArea {
    Local,
    Session,
}

impl fmt::Display for NativeArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeArea::Local => write!(f, "local"),
            NativeArea::Session => write!(f, "session"),
        }
    }
}

/// How a backend reports changes made elsewhere.
#[derive(Clone)]
pub enum BackendCapability {
    /// Host storage area; changes arrive through the host's shared storage event.
    Native(NativeArea),
    /// Custom backend with its own subscribe mechanism.
    Push(Arc<dyn ChangeSource>),
    /// Custom backend with no change notification.
    Polling,
}

impl fmt::Debug for BackendCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendCapability::Native(area) => f.debug_tuple("Native").field(area).finish(),
            BackendCapability::Push(_) => f.write_str("Push"),
            BackendCapability::Polling => f.write_str("Polling"),
        }
    }
}

/// A storage backend plus its capability tag.
///
/// Cloning a `Backend` keeps its identity.
#[derive(Clone)]
pub struct Backend {
    storage: Arc<dyn StorageBackend>,
    capability: BackendCapability,
}

impl Backend {
    /// Describe one of the host's native storage areas.
    pub fn native(area: NativeArea, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            capability: BackendCapability::Native(area),
        }
    }

    /// Describe a custom backend that can push change notifications.
    pub fn push<B>(backend: Arc<B>) -> Self
    where
        B: StorageBackend + ChangeSource + 'static,
    {
        let source: Arc<dyn ChangeSource> = backend.clone();
        Self {
            storage: backend,
            capability: BackendCapability::Push(source),
        }
    }

    /// Describe a custom backend without change notifications.
    pub fn polling(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            capability: BackendCapability::Polling,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn capability(&self) -> &BackendCapability {
        &self.capability
    }

    /// Address of the underlying allocation. Stable while the backend is alive.
    pub fn address(&self) -> usize {
        storage_address(&self.storage)
    }

    /// Reference identity comparison.
    pub fn same_as(&self, other: &Backend) -> bool {
        self.address() == other.address()
    }

    /// Whether the backend reports changes made elsewhere.
    pub fn is_observable(&self) -> bool {
        !matches!(self.capability, BackendCapability::Polling)
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage.get_item(key)
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage.set_item(key, value)
    }

    /// Read and decode the value stored under `key`.
    ///
    /// `Ok(None)` means the key is absent. Read failures surface as
    /// `SyncError::Storage`, undecodable text as `SyncError::Codec`.
    pub fn load(&self, key: &str) -> SyncResult<Option<Value>> {
        match self.storage.get_item(key)? {
            Some(raw) => Ok(Some(codec::decode(key, &raw)?)),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("capability", &self.capability)
            .finish()
    }
}

/// Thin address of a storage allocation, used for identity comparisons.
pub fn storage_address(storage: &Arc<dyn StorageBackend>) -> usize {
    Arc::as_ptr(storage) as *const () as usize
}
