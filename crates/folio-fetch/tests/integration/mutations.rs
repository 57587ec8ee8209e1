use std::time::Duration;

use folio_fetch::caching::KeyPattern;
use folio_fetch::resources::ResourceKind;
use folio_fetch::subscription::SubscribeOptions;
use serde_json::json;

use crate::{Backend, WriteupFilter, setup_fetcher, writeups};

#[tokio::test(start_paused = true)]
async fn test_edit_invalidates_family() {
    let fetcher = setup_fetcher(|_| {});
    let backend = Backend::with_latency(Duration::from_millis(10));

    let mut subs = Vec::new();
    for category in ["pwn", "web"] {
        let filter = WriteupFilter {
            category: Some(category),
            published: true,
        };
        subs.push(fetcher.subscribe(
            backend.fetch_fn(category, writeups()),
            serde_json::to_value(&filter).unwrap(),
            SubscribeOptions::cached(ResourceKind::Writeups.cache_key(&filter).unwrap()),
        ));
    }
    let mut profile = fetcher.subscribe(
        backend.fetch_fn("profile", "me"),
        json!(null),
        SubscribeOptions::cached(ResourceKind::Profile.cache_key(&1).unwrap()),
    );

    for sub in &mut subs {
        sub.settled().await;
    }
    profile.settled().await;
    assert_eq!(fetcher.stats().active, 3);

    // After editing a writeup, every writeup listing needs to be reloaded.
    let removed = fetcher.invalidate_pattern(&KeyPattern::regex("^writeups:").unwrap());
    assert_eq!(removed, 2);
    assert_eq!(fetcher.stats().active, 1);

    for sub in &subs {
        sub.refetch();
        assert!(sub.state().loading);
    }
    profile.refetch();
    assert!(!profile.state().loading);

    for sub in &mut subs {
        sub.settled().await;
    }
    assert_eq!(
        backend.all_hits(),
        [
            ("profile".to_owned(), 1),
            ("pwn".to_owned(), 2),
            ("web".to_owned(), 2)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_glob_and_single_invalidation() {
    let fetcher = setup_fetcher(|_| {});
    let cache = fetcher.cache();

    cache.set("articles:1", "intro", Duration::from_secs(60));
    cache.set("articles:2", "kernel", Duration::from_secs(60));
    cache.set("profile:1", "me", Duration::from_secs(60));

    fetcher.invalidate("articles:1");
    assert!(cache.get::<&str>("articles:1").is_none());
    assert_eq!(*cache.get::<&str>("articles:2").unwrap(), "kernel");

    let removed = fetcher.invalidate_pattern(&KeyPattern::glob("articles:*").unwrap());
    assert_eq!(removed, 1);

    fetcher.clear();
    assert_eq!(fetcher.stats().total, 0);
}
