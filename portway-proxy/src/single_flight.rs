//! Named locks that coalesce concurrent cache fills.
//!
//! One caller per key acquires the lock and fills the cache; the rest wait
//! (retrying every `retry` up to `wait`) and then either find the filled
//! cache on re-check or fall through uncached. A handle release is
//! idempotent and the lease can be extended, mirroring the contract a
//! shared-store implementation (set-if-absent with expiry) must offer.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// A held single-flight lock.
pub struct LockHandle {
    key: String,
    /// Random token identifying this holder; a shared-store backend uses
    /// it to avoid releasing someone else's lock.
    token: Uuid,
    lease_until: Instant,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockHandle {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease_until(&self) -> Instant {
        self.lease_until
    }

    /// Extend the lease. For local mutexes the lease is advisory; a shared
    /// store refreshes the key expiry here.
    pub fn extend(&mut self, new_lease: Duration) {
        self.lease_until = Instant::now() + new_lease;
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        self.guard.take();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Try to acquire the lock for `key`, polling every `retry` until
    /// `wait` has elapsed. `None` means the waiter timed out; the holder
    /// keeps the lock.
    pub async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        retry: Duration,
    ) -> Option<LockHandle> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let deadline = Instant::now() + wait;
        loop {
            match mutex.clone().try_lock_owned() {
                Ok(guard) => {
                    return Some(LockHandle {
                        key: key.to_string(),
                        token: Uuid::new_v4(),
                        lease_until: Instant::now() + lease,
                        guard: Some(guard),
                    });
                }
                Err(_) if Instant::now() + retry > deadline => return None,
                Err(_) => tokio::time::sleep(retry).await,
            }
        }
    }

    /// Drop the mutex for a key nobody holds or waits on.
    pub fn sweep(&self) {
        self.locks
            .retain(|_, mutex| Arc::strong_count(mutex) > 1 || mutex.try_lock().is_err());
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_acquisition() {
        let locks = KeyedLocks::new();
        let wait = Duration::from_millis(50);
        let lease = Duration::from_secs(30);
        let retry = Duration::from_millis(10);

        let held = locks.acquire("k", wait, lease, retry).await.unwrap();
        // Second acquisition times out while the first is held.
        assert!(locks.acquire("k", wait, lease, retry).await.is_none());
        drop(held);
        assert!(locks.acquire("k", wait, lease, retry).await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let mut held = locks
            .acquire("k", Duration::from_millis(10), Duration::from_secs(30), Duration::from_millis(5))
            .await
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire(
                        "k",
                        Duration::from_secs(2),
                        Duration::from_secs(30),
                        Duration::from_millis(5),
                    )
                    .await
                    .is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let locks = KeyedLocks::new();
        let mut held = locks
            .acquire("k", Duration::from_millis(10), Duration::from_secs(30), Duration::from_millis(5))
            .await
            .unwrap();
        held.release();
        held.release();
        assert!(
            locks
                .acquire("k", Duration::from_millis(10), Duration::from_secs(30), Duration::from_millis(5))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let a = locks
            .acquire("a", Duration::from_millis(10), Duration::from_secs(30), Duration::from_millis(5))
            .await;
        let b = locks
            .acquire("b", Duration::from_millis(10), Duration::from_secs(30), Duration::from_millis(5))
            .await;
        assert!(a.is_some() && b.is_some());
    }

    #[tokio::test]
    async fn test_lease_extension() {
        let locks = KeyedLocks::new();
        let mut held = locks
            .acquire("k", Duration::from_millis(10), Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        let before = held.lease_until();
        held.extend(Duration::from_secs(60));
        assert!(held.lease_until() > before);
    }
}
