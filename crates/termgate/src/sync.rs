//! Per-key async locks.
//!
//! The gateway serializes every operation on one session id through a lock
//! from here, so two stdin writes to the same process can never interleave.
//! Operations on different ids never touch each other's lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lock entry plus the last time anyone asked for it.
type Entry = (Arc<Mutex<()>>, Instant);

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Entry>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for `key`.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let now = Instant::now();
        self.locks
            .entry(key.to_string())
            .and_modify(|(_, seen)| *seen = now)
            .or_insert_with(|| (Arc::new(Mutex::new(())), now))
            .0
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.get(key).lock_owned().await
    }

    /// Forget `key` if nobody is holding or waiting on its lock.
    pub fn remove_if_unused(&self, key: &str) -> bool {
        self.locks
            .remove_if(key, |_, (lock, _)| Arc::strong_count(lock) == 1)
            .is_some()
    }

    /// Drop entries idle for longer than `max_idle` that nobody references.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        self.locks.retain(|_, (lock, seen)| {
            Arc::strong_count(lock) > 1 || now.duration_since(*seen) <= max_idle
        });
        before.saturating_sub(self.locks.len())
    }

    /// Sweep every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        &self,
        every: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let locks = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = locks.sweep(max_idle);
                        if removed > 0 {
                            debug!(removed, remaining = locks.len(), "swept idle session locks");
                        }
                    }
                }
            }
        })
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

    #[test]
    fn same_key_same_lock() {
        let locks = KeyedLocks::new();
        assert!(Arc::ptr_eq(&locks.get("gw_1"), &locks.get("gw_1")));
        assert!(!Arc::ptr_eq(&locks.get("gw_1"), &locks.get("gw_2")));
    }

    #[tokio::test]
    async fn acquire_serializes_one_key_only() {
        let locks = KeyedLocks::new();
        let _held = locks.acquire("gw_1").await;

        assert!(locks.get("gw_1").try_lock().is_err());
        assert!(locks.get("gw_2").try_lock().is_ok());
    }

    #[tokio::test]
    async fn remove_skips_held_lock() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire("gw_1").await;
        assert!(!locks.remove_if_unused("gw_1"));
        drop(guard);
        assert!(locks.remove_if_unused("gw_1"));
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_unreferenced_entries() {
        let locks = KeyedLocks::new();
        locks.get("old");
        let held = locks.get("held");
        tokio::time::advance(Duration::from_secs(10)).await;
        locks.get("fresh");

        assert_eq!(locks.sweep(Duration::from_secs(5)), 1);
        assert_eq!(locks.len(), 2);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let locks = KeyedLocks::new();
        let cancel = CancellationToken::new();
        let handle = locks.spawn_sweeper(
            Duration::from_secs(1),
            Duration::from_secs(1),
            cancel.clone(),
        );
        cancel.cancel();
        handle.await.unwrap();
    }
}
