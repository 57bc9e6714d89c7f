// ABOUTME: Keyed mutual exclusion for per-room serialization
// ABOUTME: One async mutex per key; operations on different keys run in parallel

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of named async locks. Everything touching the same key serializes
/// behind the same mutex; distinct keys never contend. The engine keys by
/// room id and the command processor by `cmd:`-prefixed room id; queue and
/// membership mutations are single statements already serialized by the
/// connection, so they take no key here. Entries are created on first use
/// and kept — the universe of keys is bounded by live rooms.
#[derive(Default)]
pub struct LockTable {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                table
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the entry for a key that will never be used again (a closed,
    /// archived room). Callers must not hold the guard.
    pub fn forget(&self, key: &str) {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = table.get(key) {
            if Arc::strong_count(lock) == 1 {
                table.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(LockTable::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("!room").await;
                let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inside, Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = LockTable::new();
        let _a = locks.acquire("!a").await;
        // Must not deadlock.
        let _b = locks.acquire("!b").await;
    }

    #[tokio::test]
    async fn forget_only_removes_idle_entries() {
        let locks = LockTable::new();
        let guard = locks.acquire("!a").await;
        locks.forget("!a"); // still referenced, stays
        drop(guard);
        locks.forget("!a"); // now idle, removed
        let _again = locks.acquire("!a").await;
    }
}
