//! Debounced writer.
//!
//! Coalesces writes per (backend, key) pair. A write with a positive delay
//! parks the value and arms a timer; another write to the same pair before
//! the timer fires cancels it and starts over with the new value, so only the
//! most recent value inside overlapping windows is ever persisted.
//!
//! Per pair the state machine is `idle -> pending(timer) -> idle`, left either
//! by the timer firing, by a flush, or by cancel-and-reschedule.
//!
//! Persistence failures (serialization, quota, unavailable backend) are
//! logged and dropped. They never reach the caller and never hold up other
//! pending writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tabsync_core::{codec, Backend, HostEnvironment, TeardownEvent};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::identity::{BackendRegistry, CacheKey};

/// Selects which pending writes a flush persists.
#[derive(Debug, Clone)]
pub enum FlushFilter {
    /// Every pending write.
    All,
    /// Every pending write of one backend.
    Backend(Backend),
    /// One key name on every backend.
    Key(String),
    /// A single (backend, key) pair.
    Entry(Backend, String),
}

impl FlushFilter {
    fn selects(&self, write: &PendingWrite) -> bool {
        match self {
            FlushFilter::All => true,
            FlushFilter::Backend(backend) => write.backend.same_as(backend),
            FlushFilter::Key(key) => write.key == *key,
            FlushFilter::Entry(backend, key) => write.backend.same_as(backend) && write.key == *key,
        }
    }
}

struct PendingWrite {
    cache_key: CacheKey,
    backend: Backend,
    key: String,
    value: Option<Value>,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct WriterState {
    queue: Vec<PendingWrite>,
    next_generation: u64,
}

impl WriterState {
    fn take(&mut self, cache_key: &CacheKey) -> Option<PendingWrite> {
        let index = self.queue.iter().position(|w| w.cache_key == *cache_key)?;
        Some(self.queue.remove(index))
    }
}

struct WriterInner {
    registry: Arc<BackendRegistry>,
    host: Option<Arc<dyn HostEnvironment>>,
    flush_on_teardown: bool,
    teardown_registered: AtomicBool,
    state: Mutex<WriterState>,
}

impl WriterInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let queue = std::mem::take(&mut state.queue);
        for write in queue {
            write.timer.abort();
            if self.flush_on_teardown {
                persist(&write.backend, &write.key, write.value.as_ref());
            }
        }
    }
}

/// Batches and coalesces writes to storage backends.
///
/// Cloning shares the same pending queue.
#[derive(Clone)]
pub struct DebouncedWriter {
    inner: Arc<WriterInner>,
}

impl DebouncedWriter {
    pub fn new(
        registry: Arc<BackendRegistry>,
        host: Option<Arc<dyn HostEnvironment>>,
        flush_on_teardown: bool,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                registry,
                host,
                flush_on_teardown,
                teardown_registered: AtomicBool::new(false),
                state: Mutex::new(WriterState::default()),
            }),
        }
    }

    /// Persist `value` under `key`, now or after `delay`.
    ///
    /// Any pending write for the same pair is cancelled first, on both paths.
    /// A `None` or zero delay persists synchronously. Replacing the pending
    /// entry happens under one lock, so concurrent callers leave at most one
    /// pending write per pair.
    pub fn schedule(
        &self,
        backend: &Backend,
        key: &str,
        value: Option<Value>,
        delay: Option<Duration>,
    ) {
        let cache_key = self.inner.registry.cache_key(backend, key);

        let Some(delay) = delay.filter(|d| !d.is_zero()) else {
            self.cancel_pending(&cache_key);
            persist(backend, key, value.as_ref());
            return;
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    cache_key = %cache_key,
                    delay_ms = delay.as_millis() as u64,
                    "No async runtime to arm debounce timer, persisting immediately"
                );
                self.cancel_pending(&cache_key);
                persist(backend, key, value.as_ref());
                return;
            }
        };

        self.ensure_teardown_hooks();

        let mut state = self.inner.lock();
        if let Some(previous) = state.take(&cache_key) {
            previous.timer.abort();
            debug!(cache_key = %cache_key, "Replaced pending write");
        }
        state.next_generation += 1;
        let generation = state.next_generation;

        let weak = Arc::downgrade(&self.inner);
        let timer_key = cache_key.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(weak, &timer_key, generation);
        });

        debug!(
            cache_key = %cache_key,
            delay_ms = delay.as_millis() as u64,
            "Scheduled debounced write"
        );
        state.queue.push(PendingWrite {
            cache_key,
            backend: backend.clone(),
            key: key.to_string(),
            value,
            generation,
            timer,
        });
    }

    /// Persist and remove the pending writes selected by `filter`.
    ///
    /// Unselected writes stay pending. Returns how many writes were flushed.
    pub fn flush(&self, filter: &FlushFilter) -> usize {
        let selected: Vec<PendingWrite> = {
            let mut state = self.inner.lock();
            let (selected, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|write| filter.selects(write));
            state.queue = kept;
            selected
        };

        let flushed = selected.len();
        for write in selected {
            write.timer.abort();
            persist(&write.backend, &write.key, write.value.as_ref());
        }
        if flushed > 0 {
            debug!(flushed, "Flushed pending writes");
        }
        flushed
    }

    /// Drop the pending write for a pair without persisting it.
    pub fn cancel(&self, backend: &Backend, key: &str) -> bool {
        let cache_key = self.inner.registry.cache_key(backend, key);
        self.cancel_pending(&cache_key)
    }

    /// Drop every pending write without persisting.
    pub fn reset(&self) {
        let queue = std::mem::take(&mut self.inner.lock().queue);
        for write in queue {
            write.timer.abort();
        }
    }

    pub fn is_pending(&self, backend: &Backend, key: &str) -> bool {
        let cache_key = self.inner.registry.cache_key(backend, key);
        self.inner
            .lock()
            .queue
            .iter()
            .any(|w| w.cache_key == cache_key)
    }

    /// Value parked for a pair, if any.
    pub fn pending_value(&self, backend: &Backend, key: &str) -> Option<Option<Value>> {
        let cache_key = self.inner.registry.cache_key(backend, key);
        self.inner
            .lock()
            .queue
            .iter()
            .find(|w| w.cache_key == cache_key)
            .map(|w| w.value.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn cancel_pending(&self, cache_key: &CacheKey) -> bool {
        let previous = self.inner.lock().take(cache_key);
        match previous {
            Some(write) => {
                write.timer.abort();
                debug!(cache_key = %cache_key, "Cancelled pending write");
                true
            }
            None => false,
        }
    }

    fn ensure_teardown_hooks(&self) {
        if !self.inner.flush_on_teardown {
            return;
        }
        let Some(host) = self.inner.host.as_ref() else {
            return;
        };
        if self.inner.teardown_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        for event in TeardownEvent::ALL {
            let weak = Arc::downgrade(&self.inner);
            host.add_teardown_listener(
                event,
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        let flushed = DebouncedWriter { inner }.flush(&FlushFilter::All);
                        debug!(?event, flushed, "Flushed pending writes on teardown");
                    }
                }),
            );
        }
        debug!("Registered teardown flush listeners");
    }
}

/// Timer callback: persist the pending write if it is still the one armed.
fn fire(weak: Weak<WriterInner>, cache_key: &CacheKey, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let write = {
        let mut state = inner.lock();
        let index = state
            .queue
            .iter()
            .position(|w| w.cache_key == *cache_key && w.generation == generation);
        match index {
            Some(index) => state.queue.remove(index),
            None => return,
        }
    };
    persist(&write.backend, &write.key, write.value.as_ref());
}

/// Encode and store a value. Failures are logged and reported as `false`.
pub(crate) fn persist(backend: &Backend, key: &str, value: Option<&Value>) -> bool {
    let raw = match codec::encode(key, value) {
        Ok(raw) => raw,
        Err(e) => {
            error!(key = %key, error = %e, "Cannot save value to storage");
            return false;
        }
    };
    match backend.set_item(key, &raw) {
        Ok(()) => {
            debug!(key = %key, "Persisted value");
            true
        }
        Err(e) => {
            error!(key = %key, error = %e, "Cannot save value to storage");
            false
        }
    }
}
