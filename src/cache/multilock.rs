//! Per-key mutual exclusion.
//!
//! A `MultiLock` hands out locks over an unbounded key space: any number
//! of distinct keys can be held in parallel, but each key has at most one
//! holder. Lock table entries are created on demand and removed when the
//! last interested party lets go.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::common::InodeId;

/// Key space: one lock per `(inode, blockno)`.
pub type CacheKey = (InodeId, u64);

/// Lock table over `(inode, blockno)` keys.
pub struct MultiLock {
    locks: Arc<DashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl MultiLock {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting if it is held.
    pub async fn lock(&self, key: CacheKey) -> MultiLockGuard {
        let slot = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.clone().lock_owned().await;
        MultiLockGuard {
            locks: Arc::clone(&self.locks),
            slot,
            key,
            guard: Some(guard),
        }
    }

    /// Acquire the lock for `key` only if it is free.
    pub fn try_lock(&self, key: CacheKey) -> Option<MultiLockGuard> {
        let slot = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match slot.clone().try_lock_owned() {
            Ok(guard) => Some(MultiLockGuard {
                locks: Arc::clone(&self.locks),
                slot,
                key,
                guard: Some(guard),
            }),
            Err(_) => None,
        }
    }

    /// Number of keys with a live lock table entry.
    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.locks.len()
    }
}

impl Default for MultiLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on one key. Dropping the guard releases the key and
/// garbage-collects the lock table entry if nobody else is interested.
pub struct MultiLockGuard {
    locks: Arc<DashMap<CacheKey, Arc<Mutex<()>>>>,
    slot: Arc<Mutex<()>>,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        // Release the mutex before inspecting the reference count.
        self.guard.take();
        // Two references remain when nobody is waiting: the table's and
        // ours. remove_if holds the shard lock, so no new waiter can
        // clone the Arc concurrently with the check.
        self.locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_exclusive_per_key() {
        let mlock = MultiLock::new();
        let guard = mlock.lock((1, 0)).await;
        assert!(mlock.try_lock((1, 0)).is_none());
        drop(guard);
        assert!(mlock.try_lock((1, 0)).is_some());
    }

    #[tokio::test]
    async fn test_distinct_keys_in_parallel() {
        let mlock = MultiLock::new();
        let _a = mlock.lock((1, 0)).await;
        let _b = mlock.lock((1, 1)).await;
        let _c = mlock.lock((2, 0)).await;
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let mlock = Arc::new(MultiLock::new());
        let guard = mlock.lock((7, 3)).await;

        let mlock2 = Arc::clone(&mlock);
        let waiter = tokio::spawn(async move {
            let _guard = mlock2.lock((7, 3)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_table_entries_are_collected() {
        let mlock = MultiLock::new();
        for blockno in 0..32 {
            let guard = mlock.lock((1, blockno)).await;
            drop(guard);
        }
        assert_eq!(mlock.table_len(), 0);
    }
}
