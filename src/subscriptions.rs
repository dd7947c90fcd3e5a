//! Reference-counted subscriptions keyed by name
//!
//! Several views may ask for the same push subscription (lifecycle of a
//! project, status of the workspace). The first `acquire` for a key starts it,
//! later ones only bump the count, and the last `release` drops the handle,
//! which cancels it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store::Subscription;

struct Entry<H> {
    handle: H,
    holders: usize,
}

/// Map of key -> (handle, reference count)
///
/// `H` is any RAII handle whose drop cancels the underlying subscription.
pub struct SubscriptionManager<H = Subscription> {
    entries: Arc<Mutex<HashMap<String, Entry<H>>>>,
}

impl<H> Clone for SubscriptionManager<H> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<H> Default for SubscriptionManager<H> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<H> std::fmt::Debug for SubscriptionManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.lock();
        let mut counts: Vec<(&String, usize)> =
            entries.iter().map(|(k, e)| (k, e.holders)).collect();
        counts.sort();
        f.debug_struct("SubscriptionManager")
            .field("entries", &counts)
            .finish()
    }
}

impl<H> SubscriptionManager<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `key`, calling `start` only for the first holder
    ///
    /// Returns `true` when this call started the subscription.
    pub fn acquire(&self, key: &str, start: impl FnOnce() -> H) -> bool {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.holders += 1;
            tracing::debug!("Subscription {} now has {} holders", key, entry.holders);
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                handle: start(),
                holders: 1,
            },
        );
        tracing::debug!("Subscription {} started", key);
        true
    }

    /// Drop a reference; the handle is released when the count reaches zero
    ///
    /// Returns `true` when this call cancelled the subscription.
    pub fn release(&self, key: &str) -> bool {
        let removed = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                tracing::debug!("release({}) without a matching acquire", key);
                return false;
            };
            entry.holders -= 1;
            if entry.holders > 0 {
                return false;
            }
            entries.remove(key)
        };
        // dropped outside the map lock
        drop(removed);
        tracing::debug!("Subscription {} cancelled", key);
        true
    }

    pub fn ref_count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, |e| e.holders)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Cancel every subscription regardless of holders
    pub fn clear(&self) {
        let drained: Vec<Entry<H>> = self.lock().drain().map(|(_, e)| e).collect();
        drop(drained);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<H>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
