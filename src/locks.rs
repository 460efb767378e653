//! Per-entity lock registry.
//!
//! Tasks and workers are mutated only while holding the guard for their id,
//! so concurrent submissions, retries and rebalance sweeps serialize per
//! entity without a global lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Hands out one async mutex per key.
pub struct EntityLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> EntityLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Drop the lock entry for a deleted entity.
    pub async fn forget(&self, key: &K) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            // Only the map holds it: nobody is waiting.
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl<K> Default for EntityLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
