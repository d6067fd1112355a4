use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async mutex per key: holders of the same key serialize, distinct keys run in parallel.
pub struct KeyedMutex<K, V = ()> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
}

impl<K, V> Default for KeyedMutex<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Default> KeyedMutex<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<V>> {
        // A poisoned map still holds valid Arcs; recover it.
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<V> {
        self.slot(key).lock_owned().await
    }

    /// Snapshot of the value guarded under `key`, waiting for current holders.
    pub async fn read(&self, key: &K) -> V
    where
        V: Clone,
    {
        self.lock(key).await.clone()
    }
}
