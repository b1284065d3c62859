//! Keyed async mutex
//!
//! One `tokio::sync::Mutex` per key, created on demand. Entries are held
//! weakly so idle keys don't accumulate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::OwnedMutexGuard;

type Slot = tokio::sync::Mutex<()>;

/// Guard for one key. Dropping it releases the key.
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyedLock {
    slots: Mutex<HashMap<String, Weak<Slot>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        // prune keys nobody holds or waits on
        slots.retain(|_, weak| weak.strong_count() > 0);

        let slot = Arc::new(Slot::new(()));
        slots.insert(key.to_string(), Arc::downgrade(&slot));
        slot
    }

    /// Acquire the lock for `key`. Waiters are served in acquisition order.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.slot(key).lock_owned().await
    }

    /// Number of keys with a live holder or waiter
    pub fn active_keys(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
