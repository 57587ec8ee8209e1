use std::io::Write;
use std::time::Duration;

use folio_fetch::config::Config;
use folio_fetch::subscription::Fetcher;

#[tokio::test(start_paused = true)]
async fn test_configured_sweeper() {
    folio_test::setup();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache:\n  sweep_interval: 1m").unwrap();
    let config = Config::get(Some(file.path())).unwrap();

    let fetcher = Fetcher::new(&config);
    let cache = std::sync::Arc::clone(fetcher.cache());
    cache.set("profile:1", "me", Duration::from_secs(30));
    cache.set("articles:all", "list", Duration::from_secs(5 * 60));

    tokio::time::sleep(Duration::from_secs(61)).await;
    let stats = cache.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.expired, 0);

    // Dropping the fetcher stops the sweeper, expired entries stay until read.
    drop(fetcher);
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    let stats = cache.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.expired, 1);

    assert!(cache.get::<&str>("articles:all").is_none());
    assert_eq!(cache.stats().total, 0);
}
