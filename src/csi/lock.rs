//! Keyed Resource Lock
//!
//! Serializes mutations of one backing resource while leaving unrelated
//! resources free to proceed. Entries are reference counted and leave the
//! table once the last holder or waiter is gone.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// Reference-counted table of per-key async mutexes
#[derive(Default)]
pub struct ResourceLock {
    table: Mutex<HashMap<String, Entry>>,
}

/// Exclusive hold on one key; released on drop
pub struct ResourceGuard<'a> {
    owner: &'a ResourceLock,
    key: String,
    _held: OwnedMutexGuard<()>,
}

/// Drops the table reference if the acquiring future is cancelled
struct Reservation<'a> {
    owner: &'a ResourceLock,
    key: Option<String>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.owner.release(&key);
        }
    }
}

impl ResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`
    pub async fn lock(&self, key: &str) -> ResourceGuard<'_> {
        let mutex = {
            let mut table = self.table.lock();
            let entry = table.entry(key.to_string()).or_insert_with(|| Entry {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.mutex.clone()
        };

        let mut reservation = Reservation {
            owner: self,
            key: Some(key.to_string()),
        };
        let held = mutex.lock_owned().await;

        ResourceGuard {
            owner: self,
            key: reservation.key.take().unwrap_or_default(),
            _held: held,
        }
    }

    /// Release a guard explicitly
    pub fn unlock(&self, guard: ResourceGuard<'_>) {
        drop(guard);
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                table.remove(key);
            }
        }
    }
}

impl ResourceGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let lock = ResourceLock::new();
        let a = lock.lock("region-1/pve-1/local-lvm/vm-9999-a").await;

        let b = timeout(
            Duration::from_millis(100),
            lock.lock("region-1/pve-1/local-lvm/vm-9999-b"),
        )
        .await
        .expect("distinct key must not block");

        assert_eq!(lock.len(), 2);
        drop(a);
        drop(b);
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let lock = Arc::new(ResourceLock::new());
        let first = lock.lock("vol").await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let guard = lock.lock("vol").await;
                guard.key().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        lock.unlock(first);
        let key = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "vol");
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let lock = ResourceLock::new();
        let held = lock.lock("vol").await;

        let attempt = timeout(Duration::from_millis(20), lock.lock("vol")).await;
        assert!(attempt.is_err());
        assert_eq!(lock.len(), 1);

        drop(held);
        assert!(lock.is_empty());
    }
}
