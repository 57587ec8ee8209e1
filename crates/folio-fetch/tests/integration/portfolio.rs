use std::time::Duration;

use folio_fetch::resources::ResourceKind;
use folio_fetch::subscription::{FetchStatus, SubscribeOptions};
use serde_json::json;

use crate::{Backend, WriteupFilter, setup_fetcher, writeups};

#[tokio::test(start_paused = true)]
async fn test_page_load() {
    let fetcher = setup_fetcher(|_| {});
    let backend = Backend::with_latency(Duration::from_millis(80));

    // The header and the about page both render the profile.
    let profile_key = ResourceKind::Profile.cache_key(&1).unwrap();
    let mut header = fetcher.subscribe(
        backend.fetch_fn("profile", String::from("0xfolio")),
        json!(null),
        SubscribeOptions::cached(profile_key.clone()),
    );
    let mut about = fetcher.subscribe(
        backend.fetch_fn("profile", String::from("0xfolio")),
        json!(null),
        SubscribeOptions::cached(profile_key),
    );

    let filter = WriteupFilter {
        category: None,
        published: true,
    };
    let mut listing = fetcher.subscribe(
        backend.fetch_fn("writeups", writeups()),
        serde_json::to_value(&filter).unwrap(),
        SubscribeOptions::cached(ResourceKind::Writeups.cache_key(&filter).unwrap()),
    );

    assert_eq!(fetcher.coalescer().pending_count(), 2);

    assert_eq!(*header.settled().await.data.unwrap(), "0xfolio");
    assert_eq!(*about.settled().await.data.unwrap(), "0xfolio");
    assert_eq!(listing.settled().await.data.unwrap().len(), 2);

    assert_eq!(
        backend.all_hits(),
        [("profile".to_owned(), 1), ("writeups".to_owned(), 1)]
    );
    insta::assert_yaml_snapshot!(fetcher.stats(), @r###"
    total: 2
    active: 2
    expired: 0
    "###);
}

#[tokio::test(start_paused = true)]
async fn test_filter_change() {
    let fetcher = setup_fetcher(|_| {});
    let backend = Backend::with_latency(Duration::from_millis(20));

    let subscribe_options = |filter: &WriteupFilter| {
        SubscribeOptions::cached(ResourceKind::Writeups.cache_key(filter).unwrap())
    };
    let fetch_category = |category: &'static str| {
        let rows: Vec<_> = writeups()
            .into_iter()
            .filter(|w| w.category == category)
            .collect();
        backend.fetch_fn(&format!("writeups/{category}"), rows)
    };

    let pwn = WriteupFilter {
        category: Some("pwn"),
        published: true,
    };
    let mut listing = fetcher.subscribe(
        fetch_category("pwn"),
        serde_json::to_value(&pwn).unwrap(),
        subscribe_options(&pwn),
    );
    let state = listing.settled().await;
    assert_eq!(state.data.unwrap()[0].slug, "heap-feng-shui");

    let web = WriteupFilter {
        category: Some("web"),
        published: true,
    };
    listing.update(
        fetch_category("web"),
        serde_json::to_value(&web).unwrap(),
        subscribe_options(&web),
    );
    assert!(listing.state().loading);
    let state = listing.settled().await;
    assert_eq!(state.status, FetchStatus::Success);
    assert_eq!(state.data.unwrap()[0].slug, "jwt-confusion");

    // Switching back is served from the cache.
    listing.update(
        fetch_category("pwn"),
        serde_json::to_value(&pwn).unwrap(),
        subscribe_options(&pwn),
    );
    let state = listing.state();
    assert!(!state.loading);
    assert_eq!(state.data.unwrap()[0].slug, "heap-feng-shui");

    assert_eq!(backend.hits("writeups/pwn"), 1);
    assert_eq!(backend.hits("writeups/web"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_outage() {
    let fetcher = setup_fetcher(|config| {
        config.fetch.stale_time = Duration::from_secs(5);
    });
    let backend = Backend::with_latency(Duration::from_millis(10));
    let key = ResourceKind::Certifications.cache_key(&"all").unwrap();

    let mut certifications = fetcher.subscribe(
        backend.fetch_fn("certifications", vec!["OSCP", "OSWE"]),
        json!(null),
        SubscribeOptions::cached(key),
    );
    certifications.settled().await;

    backend.fail("certifications");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(certifications.is_stale());

    fetcher.focus_events().notify_focus();
    let state = certifications.settled().await;
    assert_eq!(state.status, FetchStatus::Error);
    assert_eq!(*state.data.unwrap(), ["OSCP", "OSWE"]);
    let error = state.error.unwrap();
    assert_eq!(
        error.fetch_error().unwrap().to_string(),
        "backend unavailable: certifications"
    );

    // Still stale, so the next focus retries.
    backend.recover("certifications");
    fetcher.focus_events().notify_focus();
    let state = certifications.settled().await;
    assert_eq!(state.status, FetchStatus::Success);
    assert!(state.error.is_none());
    assert_eq!(backend.hits("certifications"), 3);
}
