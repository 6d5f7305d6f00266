//! tabsync Core - Backend Traits, Codec, Errors and Configuration
//!
//! Shared vocabulary for the tabsync workspace: the storage backend
//! capability and its descriptor, the host environment integration points,
//! the JSON text codec used for persisted values, the error taxonomy, and
//! configuration. The synchronization core itself lives in `tabsync-store`.

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod memory;
pub mod telemetry;

pub use backend::{
    storage_address, Backend, BackendCapability, ChangeListener, ChangeSource, ExternalChange,
    NativeArea, StorageBackend,
};
pub use config::{LogConfig, SyncConfig, CONFIG_ENV_VAR};
pub use error::{
    CodecError, ConfigError, StorageError, SubscriptionError, SyncError, SyncResult,
};
pub use host::{
    HostEnvironment, NativeStorageEvent, NativeStorageListener, TeardownEvent, TeardownListener,
};
pub use memory::{InMemoryHost, MemoryStorage};
pub use telemetry::init_tracing;
