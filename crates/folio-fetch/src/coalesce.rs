//! Deduplication of concurrent identical fetches.
//!
//! The [`Coalescer`] keeps track of all fetches that are currently in flight, keyed by their
//! request key. A request for a key that is already being fetched attaches to the outstanding
//! fetch instead of starting a new one. Once the fetch settles, the entry is removed, so that
//! the next request for the key starts a fresh fetch.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::FetchError;
use crate::utils::defer::defer;

type ErasedValue = Arc<dyn Any + Send + Sync>;
type FetchOutcome = Result<ErasedValue, FetchError>;
type FetchSender = oneshot::Sender<FetchOutcome>;
type FetchChannel = Shared<oneshot::Receiver<FetchOutcome>>;
type PendingMap = Arc<Mutex<HashMap<Arc<str>, FetchChannel>>>;

/// Merges concurrent requests for the same resource into a single underlying fetch.
///
/// Fetches are spawned onto the current tokio runtime and run to completion independently of the
/// callers waiting for them. Dropping the future returned by [`request`](Self::request) only
/// stops that caller from listening; the fetch keeps running for everyone else.
#[derive(Clone, Default)]
pub struct Coalescer {
    pending: PendingMap,
}

impl fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a resource, running `fetch_fn` unless a fetch for `request_key` is in flight.
    ///
    /// All callers that attach to the same fetch receive the same value, or the same error.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly register and spawn
    /// the fetch, even if the returned future is not polled right away. It has to be called from
    /// within a tokio runtime.
    pub fn request<T, F, Fut>(
        &self,
        request_key: &str,
        fetch_fn: F,
    ) -> BoxFuture<'static, Result<Arc<T>, FetchError>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (channel, sender) = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(request_key) {
                Some(channel) => {
                    tracing::trace!(request_key, "Joined pending fetch");
                    metric!(counter("coalesce.joined") += 1);
                    (channel.clone(), None)
                }
                None => {
                    metric!(counter("coalesce.started") += 1);
                    let (sender, receiver) = oneshot::channel();
                    let channel = receiver.shared();
                    pending.insert(request_key.into(), channel.clone());
                    (channel, Some(sender))
                }
            }
        };

        // The fetch is started outside of the lock, `fetch_fn` might well use the coalescer itself.
        if let Some(sender) = sender {
            self.spawn_fetch(request_key.into(), sender, fetch_fn);
        }

        let request_key = request_key.to_owned();
        Box::pin(async move {
            // The sender only goes away without sending if the fetch task died.
            let value = channel.await.unwrap_or(Err(FetchError::Aborted))?;
            value
                .downcast::<T>()
                .map_err(|_| FetchError::TypeMismatch(request_key))
        })
    }

    /// Runs `fetch_fn` as a separate task and sends its outcome to `sender`.
    ///
    /// The pending entry for `key` is removed before the outcome is sent. This ensures that
    /// callers either get a channel that will still receive data, or they start a new fetch.
    fn spawn_fetch<T, F, Fut>(&self, key: Arc<str>, sender: FetchSender, fetch_fn: F)
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        // Also evicts the entry in case `fetch_fn` or the fetch itself panics.
        let remove_pending_token = {
            let pending = Arc::clone(&self.pending);
            let key = Arc::clone(&key);
            defer(move || {
                pending.lock().unwrap().remove(&key);
            })
        };

        let span = tracing::debug_span!("fetch", request_key = %key);
        let fetch = fetch_fn();

        let task = async move {
            let start = Instant::now();
            let result = fetch.await;
            metric!(timer("coalesce.fetch.duration") = start.elapsed());

            let outcome = match result {
                Ok(value) => {
                    tracing::debug!("Fetch succeeded");
                    Ok(Arc::new(value) as ErasedValue)
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "Fetch failed");
                    Err(FetchError::from(err))
                }
            };

            // Drop the token first to evict from the map.
            drop(remove_pending_token);
            sender.send(outcome).ok();
        }
        .instrument(span)
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);
    }

    /// Returns the number of fetches currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Returns `true` if a fetch for `request_key` is in flight.
    pub fn is_pending(&self, request_key: &str) -> bool {
        self.pending.lock().unwrap().contains_key(request_key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_fetch_once() {
        folio_test::setup();
        let coalescer = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let requests: Vec<_> = (0..5)
            .map(|_| {
                let calls = Arc::clone(&calls);
                coalescer.request("profile:1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(String::from("me"))
                })
            })
            .collect();

        assert!(coalescer.is_pending("profile:1"));
        let results = join_all(requests).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_cleared() {
        let coalescer = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<u32, _>(anyhow::anyhow!("backend unavailable"))
            }
        };

        let a = coalescer.request("articles:1", fetch(Arc::clone(&calls)));
        let b = coalescer.request("articles:1", fetch(Arc::clone(&calls)));
        let (a, b) = futures::join!(a, b);

        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(a.is_same_failure(&b));
        assert_eq!(a.to_string(), "fetch failed: backend unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coalescer.is_pending("articles:1"));

        // a later request retries
        let c = coalescer.request("articles:1", fetch(Arc::clone(&calls))).await;
        assert!(c.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_cancel_fetch() {
        let coalescer = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = {
            let calls = Arc::clone(&calls);
            move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7u64)
            }
        };

        let first = coalescer.request("certifications:all", fetch);
        let second = coalescer.request("certifications:all", || async { Ok(0u64) });
        drop(first);

        assert_eq!(*second.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_fetch_independently() {
        let coalescer = Coalescer::new();
        let a = coalescer.request("writeups:a", || async { Ok("a") });
        let b = coalescer.request("writeups:b", || async { Ok("b") });
        assert_eq!(coalescer.pending_count(), 2);

        let (a, b) = futures::join!(a, b);
        assert_eq!(*a.unwrap(), "a");
        assert_eq!(*b.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch() {
        let coalescer = Coalescer::new();
        let a = coalescer.request("profile:1", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(1u32)
        });
        let b = coalescer.request::<String, _, _>("profile:1", || async { Ok(String::new()) });

        let (a, b) = futures::join!(a, b);
        assert_eq!(*a.unwrap(), 1);
        assert!(matches!(b, Err(FetchError::TypeMismatch(key)) if key == "profile:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_is_aborted() {
        let coalescer = Coalescer::new();
        let result = coalescer
            .request("profile:1", || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if true {
                    panic!("fetch exploded");
                }
                Ok(0u32)
            })
            .await;

        assert!(matches!(result, Err(FetchError::Aborted)));
        assert!(!coalescer.is_pending("profile:1"));
    }
}
