//! Composition root.
//!
//! [`SyncContext`] owns the backend registry, the debounced writer and the
//! data store, and is injected into every consumer. There is no hidden
//! process-wide singleton: two contexts are fully independent, and
//! [`SyncContext::reset`] returns one to a clean state for tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tabsync_core::{Backend, HostEnvironment, NativeArea, SyncConfig, SyncResult};
use tracing::debug;

use crate::identity::BackendRegistry;
use crate::store::{ChangeOrigin, DataStore, SubscriptionId};
use crate::writer::{DebouncedWriter, FlushFilter};

/// Builder for [`SyncContext`].
#[derive(Default)]
pub struct SyncContextBuilder {
    config: Option<SyncConfig>,
    host: Option<Arc<dyn HostEnvironment>>,
}

impl SyncContextBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Host providing native storage areas, their change event, and teardown events.
    pub fn host(mut self, host: Arc<dyn HostEnvironment>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> SyncContext {
        let config = self.config.unwrap_or_default();
        let registry = Arc::new(BackendRegistry::new());
        let writer = DebouncedWriter::new(
            registry.clone(),
            self.host.clone(),
            config.flush_on_teardown,
        );
        let store = DataStore::new(registry.clone(), writer.clone(), self.host.clone());
        debug!(
            has_host = self.host.is_some(),
            default_hysteresis_ms = ?config.default_hysteresis_ms,
            "Built sync context"
        );
        SyncContext {
            inner: Arc::new(ContextInner {
                config,
                host: self.host,
                registry,
                writer,
                store,
            }),
        }
    }
}

struct ContextInner {
    config: SyncConfig,
    host: Option<Arc<dyn HostEnvironment>>,
    registry: Arc<BackendRegistry>,
    writer: DebouncedWriter,
    store: DataStore,
}

/// Shared synchronization state for one process.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl SyncContext {
    /// Context without a host: no native areas, no teardown hooks.
    pub fn new(config: SyncConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> SyncContextBuilder {
        SyncContextBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &DataStore {
        &self.inner.store
    }

    pub fn writer(&self) -> &DebouncedWriter {
        &self.inner.writer
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.inner.registry
    }

    /// Descriptor for the host's local storage area.
    pub fn local_backend(&self) -> Option<Backend> {
        self.native_backend(NativeArea::Local)
    }

    /// Descriptor for the host's session storage area.
    pub fn session_backend(&self) -> Option<Backend> {
        self.native_backend(NativeArea::Session)
    }

    pub fn native_backend(&self, area: NativeArea) -> Option<Backend> {
        let host = self.inner.host.as_ref()?;
        host.native_storage(area)
            .map(|storage| Backend::native(area, storage))
    }

    pub fn initialize(&self, backend: &Backend, key: &str, default: Option<Value>) -> bool {
        self.inner.store.initialize(backend, key, default)
    }

    pub fn initialize_with<D>(&self, backend: &Backend, key: &str, default: D) -> bool
    where
        D: FnOnce() -> Option<Value>,
    {
        self.inner.store.initialize_with(backend, key, default)
    }

    pub fn read(&self, backend: &Backend, key: &str) -> Option<Value> {
        self.inner.store.read(backend, key)
    }

    pub fn write(&self, backend: &Backend, key: &str, value: Option<Value>) {
        self.inner.store.write(backend, key, value)
    }

    pub fn broadcast_change(
        &self,
        backend: &Backend,
        key: &str,
        value: Option<Value>,
        hysteresis: Option<Duration>,
        origin: ChangeOrigin,
    ) {
        self.inner
            .store
            .broadcast_change(backend, key, value, hysteresis, origin)
    }

    pub fn broadcast_clear(&self, backend: &Backend) {
        self.inner.store.broadcast_clear(backend)
    }

    /// Local broadcast using the configured default hysteresis.
    pub fn publish(&self, backend: &Backend, key: &str, value: Option<Value>) {
        let hysteresis = self.inner.config.default_hysteresis();
        self.inner
            .store
            .broadcast_change(backend, key, value, hysteresis, ChangeOrigin::Local)
    }

    pub fn subscribe<F>(&self, backend: &Backend, key: &str, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(backend, key, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<()> {
        self.inner.store.unsubscribe(id)
    }

    pub fn flush(&self, filter: &FlushFilter) -> usize {
        self.inner.writer.flush(filter)
    }

    pub fn flush_all(&self) -> usize {
        self.inner.writer.flush(&FlushFilter::All)
    }

    /// Drop cache, subscriptions and pending writes.
    pub fn reset(&self) {
        self.inner.store.reset();
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}
