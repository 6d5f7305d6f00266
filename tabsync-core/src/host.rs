//! Host environment integration points.
//!
//! The host owns the two native storage areas, the shared native storage
//! change event, and the lifecycle events that may end or suspend the
//! process. The sync core only consumes these; it never owns them.

use std::fmt;
use std::sync::Arc;

use crate::backend::{NativeArea, StorageBackend};

/// Lifecycle events that may terminate or suspend the process.
///
/// Some environments never fire the final-unload event, so pending writes are
/// flushed on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownEvent {
    BeforeUnload,
    PageHide,
}

impl TeardownEvent {
    pub const ALL: [TeardownEvent; 2] = [TeardownEvent::BeforeUnload, TeardownEvent::PageHide];
}

/// A native storage change event, as delivered by the host to every listener.
#[derive(Clone)]
pub struct NativeStorageEvent {
    /// The storage area that changed. `None` when the event did not come from
    /// a storage area at all.
    pub storage_area: Option<Arc<dyn StorageBackend>>,
    /// `None` when the whole area was cleared.
    pub key: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

impl fmt::Debug for NativeStorageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeStorageEvent")
            .field("has_storage_area", &self.storage_area.is_some())
            .field("key", &self.key)
            .field("new_value", &self.new_value)
            .finish()
    }
}

/// Listener for native storage change events.
pub type NativeStorageListener = Arc<dyn Fn(&NativeStorageEvent) + Send + Sync>;

/// Listener for teardown events.
pub type TeardownListener = Arc<dyn Fn() + Send + Sync>;

/// Capabilities the host environment provides to the sync core.
pub trait HostEnvironment: Send + Sync {
    /// One of the host's native storage areas, if the host has it.
    fn native_storage(&self, area: NativeArea) -> Option<Arc<dyn StorageBackend>>;

    /// Register a listener for the shared native storage change event.
    fn add_storage_listener(&self, listener: NativeStorageListener);

    /// Register a listener for a lifecycle event.
    fn add_teardown_listener(&self, event: TeardownEvent, listener: TeardownListener);
}
