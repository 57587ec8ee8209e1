//! # In-memory response caching
//!
//! Responses of the backend are kept in a process-wide [`TtlCache`]. The cache is constructed once
//! and handed to every component that needs it, usually as part of a
//! [`Fetcher`](crate::subscription::Fetcher).
//!
//! ## Expiration
//!
//! Every entry carries its own expiration deadline, computed from the TTL given to
//! [`TtlCache::set`]. Expired entries are evicted lazily: a [`TtlCache::get`] that hits an
//! expired entry removes it and reports a miss, which is indistinguishable from the key never
//! having been cached. [`TtlCache::stats`] reports expired-but-not-yet-evicted entries
//! separately.
//!
//! Optionally, a background sweeper can be spawned via [`TtlCache::spawn_sweeper`] which
//! periodically drops all expired entries. This only bounds memory usage; correctness never
//! depends on it.
//!
//! ## [`CacheKey`] / [`KeyPattern`]
//!
//! Keys have the form `<kind>:<params>`, where `<params>` is a stable serialization of the filter
//! parameters that produced the resource, for example `profile:42` or `writeups:{"tag":"web"}`.
//! After a mutation, a whole family of keys can be dropped with [`TtlCache::invalidate_pattern`]
//! and a [`KeyPattern`], for example all `writeups:*` entries after a write-up was edited.
//!
//! ### Metrics
//!
//! - `cache.access`: All reads.
//! - `cache.hit`: Reads served from the cache.
//! - `cache.miss`: Reads of keys that were never cached or already evicted.
//! - `cache.expired`: Reads that lazily evicted an expired entry.
//! - `cache.invalidate`: Number of entries removed by invalidation.
//! - `cache.sweep`: Number of entries removed by the background sweeper.

mod cache_key;
mod ttl_cache;

pub use cache_key::{CacheKey, KeyPattern};
pub use ttl_cache::{CacheStats, TtlCache};

#[cfg(test)]
mod tests;
