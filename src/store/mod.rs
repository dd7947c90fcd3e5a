//! Reactive state containers
//!
//! Every store is a [`Store<S>`]: a cloneable, thread-safe handle exposing
//! `get_state`, `set_state` and `subscribe`. Frontends subscribe to whole
//! states or to selector-derived slices and re-render when they change; the
//! binding to any particular UI framework stays a thin adapter on top.
//!
//! - **timeline**: paginated event log of the live conversation
//! - **streaming**: typewriter draft of the response being streamed
//! - **execution**: work plan, per-step status, tool-call lifecycle
//! - **plan_mode**: plan document and build/plan/explore status
//! - **conversations**: conversation list and the active conversation
//! - **hitl**: pending human-in-the-loop requests with timeout expiry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

pub mod conversations;
pub mod execution;
pub mod hitl;
pub mod plan_mode;
pub mod streaming;
pub mod timeline;

pub use conversations::{ConversationsState, ConversationsStore};
pub use execution::{ExecutionState, ExecutionStore};
pub use hitl::{HitlState, HitlStore, TimeoutChecker};
pub use plan_mode::{PlanModeState, PlanModeStore};
pub use streaming::{StreamingPhase, StreamingState, StreamingStore};
pub use timeline::{TimelineLoad, TimelineState, TimelineStore};

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Shared, observable state container
pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

struct StoreInner<S> {
    name: &'static str,
    state: RwLock<S>,
    listeners: Mutex<Vec<(u64, Listener<S>)>>,
    next_listener_id: AtomicU64,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("state", &*self.read())
            .finish()
    }
}

impl<S> Store<S> {
    fn read(&self) -> RwLockReadGuard<'_, S> {
        self.inner.state.read().unwrap_or_else(|poisoned| {
            tracing::warn!("{} store read lock was poisoned, recovering", self.inner.name);
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, S> {
        self.inner.state.write().unwrap_or_else(|poisoned| {
            tracing::warn!("{} store write lock was poisoned, recovering", self.inner.name);
            poisoned.into_inner()
        })
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener<S>)>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Create a store holding `initial`; `name` is used in log output
    pub fn new(name: &'static str, initial: S) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name,
                state: RwLock::new(initial),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Clone of the current state
    pub fn get_state(&self) -> S {
        self.read().clone()
    }

    /// Read the state without cloning it
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.read())
    }

    /// Mutate the state and notify subscribers
    pub fn set_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = self.set_state_quiet(f);
        self.notify();
        result
    }

    /// Mutate the state without notifying; pair with [`Store::notify`]
    pub fn set_state_quiet<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.write();
        f(&mut guard)
    }

    /// Replace the whole state and notify subscribers
    pub fn replace(&self, state: S) {
        self.set_state(|s| *s = state);
    }

    /// Publish the current state to every subscriber
    ///
    /// Listeners receive a clone taken after all locks are released, so a
    /// listener may call back into the store.
    pub fn notify(&self) {
        let listeners: Vec<Listener<S>> = {
            let guard = self.lock_listeners();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.get_state();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Register a listener called after every notified change
    pub fn subscribe(&self, listener: impl Fn(&S) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push((id, Arc::new(listener)));

        let weak: Weak<StoreInner<S>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut listeners = inner
                    .listeners
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Register a listener on a derived slice; it fires only when the slice changes
    pub fn subscribe_selector<T>(
        &self,
        selector: impl Fn(&S) -> T + Send + Sync + 'static,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription
    where
        T: PartialEq + Send + 'static,
    {
        let last = Mutex::new(self.with_state(&selector));
        self.subscribe(move |state| {
            let next = selector(state);
            let mut last = last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *last != next {
                listener(&next);
                *last = next;
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_listeners().len()
    }
}

/// Handle returned by `subscribe`; the listener is removed on drop
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener now
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
