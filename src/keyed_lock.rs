//! Per-key async locks.
//!
//! Work on the same connection is serialized while different connections proceed
//! concurrently. Entries are dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

/// Held lock for one key
#[derive(Debug)]
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock for `key` is free and take it.
    pub async fn lock(&self, key: Uuid) -> KeyedGuard {
        let entry = {
            let mut map = self.inner.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key).or_default().clone()
        };
        KeyedGuard {
            _guard: entry.lock_owned().await,
        }
    }

    /// Take the lock for `key` only if it is free right now.
    #[cfg(test)]
    async fn try_lock(&self, key: Uuid) -> Option<KeyedGuard> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key).or_default().clone()
        };
        entry
            .try_lock_owned()
            .ok()
            .map(|guard| KeyedGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let key = Uuid::new_v4();

        let guard = locks.lock(key).await;
        assert!(locks.try_lock(key).await.is_none());
        drop(guard);
        assert!(locks.try_lock(key).await.is_some());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = KeyedLocks::new();
        for _ in 0..3 {
            drop(locks.lock(Uuid::new_v4()).await);
        }
        let _held = locks.lock(Uuid::new_v4()).await;
        assert_eq!(locks.inner.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = KeyedLocks::new();
        let key = Uuid::new_v4();
        let guard = locks.lock(key).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
