use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::KeyPattern;

type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Stands in for the expiration of entries whose TTL exceeds what an [`Instant`] can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The shortest interval [`TtlCache::spawn_sweeper`] runs with.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// An item saved in the [`TtlCache`].
#[derive(Clone)]
struct CacheEntry {
    value: ErasedValue,
    created_at: Instant,
    /// The entry must not be handed out after this point in time.
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: ErasedValue, ttl: Duration) -> Self {
        let created_at = Instant::now();
        CacheEntry {
            value,
            created_at,
            expires_at: created_at
                .checked_add(ttl)
                .unwrap_or_else(|| created_at + FAR_FUTURE),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// A diagnostic snapshot of a [`TtlCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// All entries currently held, expired or not.
    pub total: usize,
    /// Entries that can still be returned.
    pub active: usize,
    /// Entries that are past their expiration but were not evicted yet.
    pub expired: usize,
}

/// A keyed store of arbitrary values with per-entry expiration.
///
/// Values are stored type-erased; every read names the type it expects. Reading a key with a
/// different type than it was written with behaves like a miss.
///
/// All methods lock internally, the cache can be shared freely behind an [`Arc`].
#[derive(Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<Arc<str>, CacheEntry>>,
}

impl fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, to be returned for the next `ttl`.
    ///
    /// Any existing entry is overwritten, regardless of its type or remaining lifetime.
    pub fn set<T>(&self, key: impl AsRef<str>, value: T, ttl: Duration)
    where
        T: Any + Send + Sync,
    {
        self.set_shared(key, Arc::new(value), ttl)
    }

    /// Same as [`set`](Self::set), for values that are already shared.
    ///
    /// Reads return the very same [`Arc`].
    pub fn set_shared<T>(&self, key: impl AsRef<str>, value: Arc<T>, ttl: Duration)
    where
        T: Any + Send + Sync,
    {
        let key = key.as_ref();
        tracing::trace!(key, ?ttl, "Storing cache entry");
        let entry = CacheEntry::new(value, ttl);
        self.entries.lock().unwrap().insert(key.into(), entry);
    }

    /// Returns the value stored under `key` unless it expired.
    ///
    /// An expired entry is removed as a side effect.
    pub fn get<T>(&self, key: impl AsRef<str>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let key = key.as_ref();
        let now = Instant::now();
        metric!(counter("cache.access") += 1);

        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(key) else {
            metric!(counter("cache.miss") += 1);
            return None;
        };

        if entry.is_expired(now) {
            let age = now.duration_since(entry.created_at);
            entries.remove(key);
            drop(entries);

            tracing::trace!(key, ?age, "Evicted expired cache entry");
            metric!(counter("cache.expired") += 1);
            return None;
        }

        match Arc::clone(&entry.value).downcast::<T>() {
            Ok(value) => {
                metric!(counter("cache.hit") += 1);
                Some(value)
            }
            Err(_) => {
                tracing::warn!(
                    key,
                    expected = std::any::type_name::<T>(),
                    "Cached value has an unexpected type"
                );
                metric!(counter("cache.miss") += 1);
                None
            }
        }
    }

    /// Removes the entry stored under `key`, if any.
    pub fn invalidate(&self, key: impl AsRef<str>) {
        let key = key.as_ref();
        if self.entries.lock().unwrap().remove(key).is_some() {
            tracing::debug!(key, "Invalidated cache entry");
            metric!(counter("cache.invalidate") += 1);
        }
    }

    /// Removes all entries whose key matches `pattern`.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|key, _| !pattern.matches(key));
            before - entries.len()
        };

        tracing::debug!(%pattern, removed, "Invalidated cache entries");
        metric!(counter("cache.invalidate") += removed as i64);
        removed
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let len = entries.len();
            entries.clear();
            len
        };
        tracing::debug!(removed, "Cleared cache");
        metric!(counter("cache.invalidate") += removed as i64);
    }

    /// Eagerly removes all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        let expired = entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .count();

        CacheStats {
            total: entries.len(),
            active: entries.len() - expired,
            expired,
        }
    }

    /// Spawns a task that calls [`purge_expired`](Self::purge_expired) every `interval`.
    ///
    /// The task stops once `token` is cancelled or the cache is dropped. Intervals below a
    /// millisecond are rounded up.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let interval = interval.max(MIN_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(cache) = cache.upgrade() else {
                    break;
                };

                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Swept expired cache entries");
                }
                metric!(counter("cache.sweep") += purged as i64);
                metric!(gauge("cache.entries") = cache.stats().total as u64);
            }

            tracing::trace!("Cache sweeper stopped");
        })
    }
}
