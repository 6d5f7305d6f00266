//! tabsync Store - Debounced Writer, Reactive Data Store and Change Bridge
//!
//! Keeps every consumer of a (backend, key) pair looking at the same value,
//! inside one process and across processes sharing the same storage.
//!
//! - [`DebouncedWriter`] coalesces bursts of writes per pair.
//! - [`DataStore`] caches values and fans changes out to subscribers.
//! - The bridge turns external storage changes into store broadcasts.
//! - [`SyncContext`] wires the three together, and [`StoredState`] is the
//!   consumer-facing handle on top of it.

pub mod bridge;
pub mod context;
pub mod handle;
pub mod identity;
pub mod store;
pub mod writer;

pub use bridge::apply_external_change;
pub use context::{SyncContext, SyncContextBuilder};
pub use handle::StoredState;
pub use identity::{BackendId, BackendRegistry, CacheKey};
pub use store::{Callback, ChangeOrigin, DataStore, SubscriptionId};
pub use writer::{DebouncedWriter, FlushFilter};

// Re-export the shared vocabulary so consumers need a single dependency
pub use tabsync_core;
