use folio_fetch::config::Config;
use folio_fetch::subscription::Fetcher;
use folio_test as test;
use serde::Serialize;

pub use test::{Backend, Script};

/// Setup tests and create a fetcher.
///
/// The `update_config` closure can modify any default configuration if needed before the fetcher
/// is created.
pub fn setup_fetcher(update_config: impl FnOnce(&mut Config)) -> Fetcher {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    Fetcher::new(&config)
}

/// A row of the writeups table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Writeup {
    pub slug: &'static str,
    pub title: &'static str,
    pub category: &'static str,
}

/// Filter parameters of the writeup listing.
#[derive(Debug, Clone, Serialize)]
pub struct WriteupFilter {
    pub category: Option<&'static str>,
    pub published: bool,
}

pub fn writeups() -> Vec<Writeup> {
    vec![
        Writeup {
            slug: "heap-feng-shui",
            title: "Heap Feng Shui on glibc 2.35",
            category: "pwn",
        },
        Writeup {
            slug: "jwt-confusion",
            title: "JWT algorithm confusion",
            category: "web",
        },
    ]
}
