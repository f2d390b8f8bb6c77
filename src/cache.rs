//! Per-URL cache of lazily started instances
//!
//! The map lock only covers map access. Initialisation of a missing entry
//! runs through that entry's own [`OnceCell`], so concurrent first lookups of
//! one key share a single start without blocking other keys.
//!
//! Removing a key whose instance is still starting leaves a mark on the entry.
//! The start then completes as [`Lookup::Closed`] and exactly one caller is
//! handed the instance to shut down, so nothing outlives its removal.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{Mutex, OnceCell};

/// Flags are only written with the map locked
struct Entry<T> {
    cell: OnceCell<T>,
    removed: AtomicBool,
    retired: AtomicBool,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
            removed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> Entry<T> {
    /// Hands out the started instance to the first claimant only
    fn claim(&self) -> Option<T> {
        let instance = self.cell.get()?;
        (!self.retired.swap(true, Ordering::Relaxed)).then(|| instance.clone())
    }
}

/// Result of [`InstanceCache::get_or_try_init`]
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<T> {
    Ready(T),
    /// The key was removed before its start finished. `orphan` is set for the
    /// one caller that must shut the instance down.
    Closed { orphan: Option<T> },
}

pub struct InstanceCache<T> {
    entries: Mutex<HashMap<String, Arc<Entry<T>>>>,
}

impl<T> Default for InstanceCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> InstanceCache<T> {
    /// Returns the cached instance for `key`, starting it with `init` if absent.
    ///
    /// A failed `init` leaves the entry empty, so a later call tries again.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &str, init: F) -> Result<Lookup<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.entry(key.to_owned()).or_default().clone()
        };
        let instance = entry.cell.get_or_try_init(init).await?.clone();

        let _entries = self.entries.lock().await;
        if entry.removed.load(Ordering::Relaxed) {
            return Ok(Lookup::Closed {
                orphan: entry.claim(),
            });
        }
        Ok(Lookup::Ready(instance))
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|entry| entry.cell.get().cloned())
    }

    /// Removes `key` and hands its instance, if it already started, to
    /// `retire` while the map is still locked.
    ///
    /// A start still in flight is marked instead and retired by whoever
    /// awaits it.
    pub async fn remove_with<F>(&self, key: &str, retire: F) -> Option<T>
    where
        F: FnOnce(&T),
    {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(key)?;
        entry.removed.store(true, Ordering::Relaxed);
        let instance = entry.claim()?;
        retire(&instance);
        Some(instance)
    }

    /// Empties the cache, returning every started instance
    pub async fn drain(&self) -> Vec<T> {
        let mut entries = self.entries.lock().await;
        entries
            .drain()
            .filter_map(|(_, entry)| {
                entry.removed.store(true, Ordering::Relaxed);
                entry.claim()
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|entry| entry.cell.initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn concurrent_init_runs_once() {
        let cache = Arc::new(InstanceCache::<usize>::default());
        let starts = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let starts = starts.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_try_init("k", || async move {
                            tokio::task::yield_now().await;
                            Ok::<_, ()>(starts.fetch_add(1, Ordering::SeqCst) + 100)
                        })
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.unwrap(), Ok(Lookup::Ready(100)));
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_init_is_retried() {
        let cache = InstanceCache::<u8>::default();
        let first = cache.get_or_try_init("k", || async { Err("boom") }).await;
        assert_eq!(first, Err("boom"));
        assert_eq!(cache.get("k").await, None);

        let second = cache.get_or_try_init("k", || async { Ok::<_, &str>(7) }).await;
        assert_eq!(second, Ok(Lookup::Ready(7)));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let cache = InstanceCache::<u8>::default();
        assert_eq!(cache.remove_with("missing", |_| ()).await, None);

        cache.get_or_try_init("k", || async { Ok::<_, ()>(1) }).await.unwrap();
        let mut retired = 0;
        assert_eq!(cache.remove_with("k", |_| retired += 1).await, Some(1));
        assert_eq!(cache.remove_with("k", |_| retired += 1).await, None);
        assert_eq!(retired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_during_init_orphans_the_instance() {
        let cache = Arc::new(InstanceCache::<u8>::default());

        let slow = |value| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_try_init("k", || async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, ()>(value)
                    })
                    .await
            })
        };
        let first = slow(1);
        let second = slow(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut retired = 0;
        assert_eq!(cache.remove_with("k", |_| retired += 1).await, None);
        assert_eq!(retired, 0);

        let mut orphans = 0;
        for outcome in [first.await.unwrap(), second.await.unwrap()] {
            match outcome {
                Ok(Lookup::Closed { orphan }) => orphans += usize::from(orphan.is_some()),
                other => panic!("start survived its removal: {other:?}"),
            }
        }
        assert_eq!(orphans, 1);
        assert_eq!(cache.len().await, 0);

        let fresh = cache.get_or_try_init("k", || async { Ok::<_, ()>(3) }).await;
        assert_eq!(fresh, Ok(Lookup::Ready(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_during_init_orphans_the_instance() {
        let cache = Arc::new(InstanceCache::<u8>::default());
        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_try_init("k", || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, ()>(9)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cache.drain().await.is_empty());
        assert_eq!(
            pending.await.unwrap(),
            Ok(Lookup::Closed { orphan: Some(9) })
        );
    }
}
