//! Consumer handle for one stored key.
//!
//! [`StoredState`] is the piece a UI layer (or any other consumer) holds:
//! it subscribes, initializes the key, publishes the default when the
//! backend had nothing stored, and unsubscribes when dropped.

use std::time::Duration;

use serde_json::Value;
use tabsync_core::Backend;

use crate::context::SyncContext;
use crate::store::{ChangeOrigin, SubscriptionId};

/// A subscribed, initialized view of one (backend, key) pair.
pub struct StoredState {
    ctx: SyncContext,
    backend: Backend,
    key: String,
    hysteresis: Option<Duration>,
    subscription: Option<SubscriptionId>,
}

impl StoredState {
    /// Subscribe `on_change` and initialize the pair.
    ///
    /// When the backend has no stored value, `default` is published (cached,
    /// persisted with `hysteresis`, and broadcast to every subscriber of the
    /// pair, `on_change` included).
    pub fn open<F>(
        ctx: &SyncContext,
        backend: Backend,
        key: impl Into<String>,
        default: Option<Value>,
        hysteresis: Option<Duration>,
        on_change: F,
    ) -> Self
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        Self::open_with(ctx, backend, key, || default, hysteresis, on_change)
    }

    /// Like [`StoredState::open`], with a lazily built default. `default` runs
    /// only when neither the cache nor the backend holds a value.
    pub fn open_with<D, F>(
        ctx: &SyncContext,
        backend: Backend,
        key: impl Into<String>,
        default: D,
        hysteresis: Option<Duration>,
        on_change: F,
    ) -> Self
    where
        D: FnOnce() -> Option<Value>,
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let key = key.into();
        let subscription = ctx.subscribe(&backend, &key, on_change);
        if ctx.initialize_with(&backend, &key, default) {
            let seeded = ctx.read(&backend, &key);
            ctx.broadcast_change(&backend, &key, seeded, hysteresis, ChangeOrigin::Local);
        }
        Self {
            ctx: ctx.clone(),
            backend,
            key,
            hysteresis,
            subscription: Some(subscription),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    pub fn get(&self) -> Option<Value> {
        self.ctx.read(&self.backend, &self.key)
    }

    /// Publish a new value to every consumer of the pair.
    pub fn set(&self, value: Option<Value>) {
        self.ctx.broadcast_change(
            &self.backend,
            &self.key,
            value,
            self.hysteresis,
            ChangeOrigin::Local,
        );
    }

    /// Apply `reducer` to the current value and publish the result.
    pub fn dispatch<A, R>(&self, reducer: R, action: A)
    where
        R: FnOnce(Option<Value>, A) -> Option<Value>,
    {
        let next = reducer(self.get(), action);
        self.set(next);
    }
}

impl Drop for StoredState {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            let _ = self.ctx.unsubscribe(id);
        }
    }
}
