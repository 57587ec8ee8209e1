//! Data-fetching layer of the folio site.
//!
//! The site renders a profile, write-ups and articles that live in a hosted relational backend.
//! This crate sits between the UI and that backend and provides:
//!
//! - a process-wide [`TtlCache`](caching::TtlCache) with per-entry expiration,
//! - a [`Coalescer`](coalesce::Coalescer) that merges concurrent identical fetches,
//! - the [`Fetcher`](subscription::Fetcher), which hands out reactive
//!   [`Subscription`](subscription::Subscription)s combining both with staleness, cancellation and
//!   refetch triggers.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod focus;
pub mod logging;
pub mod resources;
pub mod subscription;
pub mod utils;

pub use error::FetchError;
