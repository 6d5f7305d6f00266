//! Backend identity tokens.
//!
//! Cache keys are namespaced by a token assigned the first time a backend
//! allocation is seen, so the same key name in two backends never collides.
//! Tokens are never reclaimed; the registry keeps each backend alive so its
//! address cannot be reused by a later allocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tabsync_core::{Backend, StorageBackend};

/// Opaque, stable identifier for one backend allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendId(u64);

impl BackendId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache key: backend token plus key name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub backend: BackendId,
    pub key: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.key)
    }
}

#[derive(Default)]
struct RegistryState {
    by_address: HashMap<usize, BackendId>,
    // Pins every seen backend for the registry's lifetime.
    retained: Vec<Arc<dyn StorageBackend>>,
    next: u64,
}

/// Identity-keyed mapping from backend allocation to [`BackendId`].
#[derive(Default)]
pub struct BackendRegistry {
    state: Mutex<RegistryState>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `backend`, assigning a new one on first sight.
    pub fn id_of(&self, backend: &Backend) -> BackendId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let address = backend.address();
        if let Some(id) = state.by_address.get(&address) {
            return *id;
        }
        let id = BackendId(state.next);
        state.next += 1;
        state.by_address.insert(address, id);
        state.retained.push(backend.storage().clone());
        id
    }

    pub fn cache_key(&self, backend: &Backend, key: &str) -> CacheKey {
        CacheKey {
            backend: self.id_of(backend),
            key: key.to_string(),
        }
    }

    /// Number of distinct backends seen so far.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retained
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::MemoryStorage;

    #[test]
    fn test_ids_are_assigned_in_first_seen_order() {
        let registry = BackendRegistry::new();
        let a = Backend::polling(Arc::new(MemoryStorage::new()));
        let b = Backend::polling(Arc::new(MemoryStorage::new()));

        assert_eq!(registry.id_of(&a).as_u64(), 0);
        assert_eq!(registry.id_of(&b).as_u64(), 1);
        assert_eq!(registry.id_of(&a).as_u64(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_cache_key_display() {
        let registry = BackendRegistry::new();
        let s = Backend::polling(Arc::new(MemoryStorage::new()));
        assert_eq!(registry.cache_key(&s, "count").to_string(), "0:count");
    }

    #[test]
    fn test_same_key_distinct_backends_distinct_cache_keys() {
        let registry = BackendRegistry::new();
        let a = Backend::polling(Arc::new(MemoryStorage::new()));
        let b = Backend::polling(Arc::new(MemoryStorage::new()));
        assert_ne!(registry.cache_key(&a, "k"), registry.cache_key(&b, "k"));
    }

    #[test]
    fn test_dropped_backend_address_is_not_reused() {
        let registry = BackendRegistry::new();
        let first = registry.id_of(&Backend::polling(Arc::new(MemoryStorage::new())));
        let second = registry.id_of(&Backend::polling(Arc::new(MemoryStorage::new())));
        assert_ne!(first, second);
    }
}
