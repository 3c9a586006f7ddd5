//! Reference-counted binary semaphore scoped to an arbitrary key.
//!
//! Each key maps to `{lock, refcount}`. The refcount is bumped under the map
//! guard before an acquirer waits on the lock, and dropped under the same
//! guard after the lock is released. An entry is evicted only when its count
//! reaches zero, so a waiter can never find its entry gone.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refcount: usize,
}

struct Shared<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash> Shared<K> {
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &K) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            panic!("keyed semaphore released a key that has no entry");
        };
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entries.remove(key);
        }
    }
}

pub struct KeyedSemaphore<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for KeyedSemaphore<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedSemaphore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedSemaphore<K> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wait until no other holder of `key` exists, then hold it until the
    /// returned guard is released or dropped.
    ///
    /// Cancel-safe: dropping the future while it waits gives back its
    /// reference without ever holding the lock.
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut entries = self.shared.entries();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            Arc::clone(&entry.lock)
        };

        let mut guard = KeyedGuard {
            shared: Arc::clone(&self.shared),
            key: Some(key),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    /// Number of keys with at least one holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.shared.entries().len()
    }

    /// Holders plus waiters for `key`.
    pub fn refcount(&self, key: &K) -> usize {
        self.shared.entries().get(key).map_or(0, |e| e.refcount)
    }
}

/// Proof of exclusive ownership of one key. Released exactly once, either by
/// [`KeyedGuard::release`] or on drop.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedGuard<K: Eq + Hash> {
    shared: Arc<Shared<K>>,
    key: Option<K>,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        // Unlock first, then give back the reference.
        drop(self.held.take());
        if let Some(key) = self.key.take() {
            self.shared.release(&key);
        }
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyedGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("key", &self.key)
            .field("held", &self.held.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_last_release() {
        let semaphore = KeyedSemaphore::new();
        let guard = semaphore.acquire("a".to_string()).await;
        assert_eq!(semaphore.refcount(&"a".to_string()), 1);
        guard.release();
        assert_eq!(semaphore.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let semaphore = KeyedSemaphore::new();
        let _a = semaphore.acquire(1u32).await;
        let b = tokio::time::timeout(Duration::from_millis(200), semaphore.acquire(2u32)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_same_key_blocks_until_release() {
        let semaphore = KeyedSemaphore::new();
        let first = semaphore.acquire("k").await;

        let contender = semaphore.clone();
        let waiter = tokio::spawn(async move {
            let _second = contender.acquire("k").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(semaphore.refcount(&"k"), 2);

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert_eq!(semaphore.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_leak() {
        let semaphore = KeyedSemaphore::new();
        let holder = semaphore.acquire("k").await;

        let pending = tokio::time::timeout(Duration::from_millis(20), semaphore.acquire("k")).await;
        assert!(pending.is_err());
        assert_eq!(semaphore.refcount(&"k"), 1);

        drop(holder);
        assert_eq!(semaphore.active_keys(), 0);
    }

    #[test]
    #[should_panic(expected = "no entry")]
    fn test_release_without_entry_panics() {
        let shared = Shared::<&str> {
            entries: Mutex::new(HashMap::new()),
        };
        shared.release(&"missing");
    }
}
