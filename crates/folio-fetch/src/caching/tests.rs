use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;

const TTL: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_get_before_and_after_ttl() {
    folio_test::setup();
    let cache = TtlCache::new();

    cache.set("profile:1", String::from("hello"), TTL);
    assert_eq!(
        cache.get::<String>("profile:1").as_deref().map(String::as_str),
        Some("hello")
    );

    // the deadline itself is still valid
    tokio::time::advance(TTL).await;
    assert!(cache.get::<String>("profile:1").is_some());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(cache.get::<String>("profile:1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_ttl() {
    let cache = TtlCache::new();
    cache.set("profile:1", 1u32, Duration::MAX);

    tokio::time::advance(Duration::from_secs(86400 * 365)).await;
    assert_eq!(cache.get::<u32>("profile:1").as_deref(), Some(&1));
    assert_eq!(cache.purge_expired(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_in_stats() {
    let cache = TtlCache::new();

    cache.set("articles:1", 1u32, Duration::from_secs(10));
    cache.set("articles:2", 2u32, Duration::from_secs(100));
    assert_eq!(
        cache.stats(),
        CacheStats {
            total: 2,
            active: 2,
            expired: 0
        }
    );

    tokio::time::advance(Duration::from_secs(20)).await;
    insta::assert_yaml_snapshot!(cache.stats(), @r###"
    total: 2
    active: 1
    expired: 1
    "###);

    // reading the expired entry evicts it, and keeps reporting it as absent
    assert!(cache.get::<u32>("articles:1").is_none());
    assert!(cache.get::<u32>("articles:1").is_none());
    assert_eq!(
        cache.stats(),
        CacheStats {
            total: 1,
            active: 1,
            expired: 0
        }
    );
}

#[test]
fn test_overwrite_resets_value_and_type() {
    let cache = TtlCache::new();

    cache.set("profile:1", 1u32, TTL);
    cache.set("profile:1", String::from("replaced"), TTL);

    assert!(cache.get::<u32>("profile:1").is_none());
    assert_eq!(*cache.get::<String>("profile:1").unwrap(), "replaced");
}

#[test]
fn test_type_mismatch_is_a_miss() {
    let cache = TtlCache::new();
    cache.set("profile:1", 42u64, TTL);

    assert!(cache.get::<String>("profile:1").is_none());
    // the entry is not evicted by a mismatching read
    assert_eq!(*cache.get::<u64>("profile:1").unwrap(), 42);
}

#[test]
fn test_set_shared_returns_same_arc() {
    let cache = TtlCache::new();
    let value = Arc::new(vec![1, 2, 3]);
    cache.set_shared("writeups:all", Arc::clone(&value), TTL);

    let cached = cache.get::<Vec<i32>>("writeups:all").unwrap();
    assert!(Arc::ptr_eq(&value, &cached));
}

#[test]
fn test_invalidate() {
    let cache = TtlCache::new();
    cache.set("profile:1", (), TTL);

    cache.invalidate("profile:1");
    assert!(cache.get::<()>("profile:1").is_none());

    // no-op on absent keys
    cache.invalidate("profile:1");
    assert_eq!(cache.stats().total, 0);
}

#[test]
fn test_invalidate_pattern() {
    let cache = TtlCache::new();
    cache.set("writeups:a", "a", TTL);
    cache.set("writeups:b", "b", TTL);
    cache.set("profile:1", "me", TTL);

    let removed = cache.invalidate_pattern(&KeyPattern::regex("^writeups:").unwrap());
    assert_eq!(removed, 2);

    assert_eq!(*cache.get::<&str>("profile:1").unwrap(), "me");
    assert!(cache.get::<&str>("writeups:a").is_none());
    assert!(cache.get::<&str>("writeups:b").is_none());
}

#[test]
fn test_invalidate_glob() {
    let cache = TtlCache::new();
    cache.set(r#"articles:{"page":1}"#, 1, TTL);
    cache.set(r#"articles:{"page":2}"#, 2, TTL);
    cache.set("certifications:all", 3, TTL);

    let removed = cache.invalidate_pattern(&KeyPattern::glob("articles:*").unwrap());
    assert_eq!(removed, 2);
    assert_eq!(cache.stats().total, 1);
}

#[test]
fn test_clear() {
    let cache = TtlCache::new();
    cache.set("a:1", 1, TTL);
    cache.set("b:1", 1, TTL);

    cache.clear();
    assert_eq!(cache.stats(), CacheStats::default());
}

#[tokio::test(start_paused = true)]
async fn test_purge_expired() {
    let cache = TtlCache::new();
    cache.set("a:1", 1, Duration::from_secs(1));
    cache.set("a:2", 2, Duration::from_secs(1));
    cache.set("a:3", 3, Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.purge_expired(), 2);
    assert_eq!(cache.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper() {
    folio_test::setup();
    let cache = Arc::new(TtlCache::new());
    let token = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(Duration::from_secs(30), token.clone());

    cache.set("a:1", 1, Duration::from_secs(10));
    cache.set("a:2", 2, Duration::from_secs(120));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        cache.stats(),
        CacheStats {
            total: 1,
            active: 1,
            expired: 0
        }
    );

    token.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_stops_with_cache() {
    let cache = Arc::new(TtlCache::new());
    let sweeper = cache.spawn_sweeper(Duration::from_secs(1), CancellationToken::new());

    drop(cache);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(sweeper.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_with_zero_interval() {
    let cache = Arc::new(TtlCache::new());
    let token = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(Duration::ZERO, token.clone());

    cache.set("a:1", 1, Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.stats().total, 0);
    assert!(!sweeper.is_finished());

    token.cancel();
    sweeper.await.unwrap();
}
