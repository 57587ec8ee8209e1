//! Helpers for testing the fetch layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Time-dependent tests should run with a paused clock, using
//!    `#[tokio::test(start_paused = true)]`. All delays in this crate use tokio's clock, so they
//!    advance instantly once every task is idle.
//!
//!  - Fetch functions handed out by [`Backend`] and [`Script`] share their counters with the
//!    value they were created from. Keep that value around to inspect the calls after the fact.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `folio_fetch` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("folio_fetch=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A simulated backend that counts how often each resource is loaded.
///
/// Every resource responds after the configured latency. Resources can be switched to failing
/// and back at any time.
#[derive(Clone, Debug, Default)]
pub struct Backend {
    latency: Duration,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Returns a fetch function that loads `resource` and resolves to `value`.
    pub fn fetch_fn<T>(
        &self,
        resource: &str,
        value: T,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<T>> + Clone + Send + Sync + 'static + use<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let backend = self.clone();
        let resource = resource.to_owned();

        move || {
            let backend = backend.clone();
            let resource = resource.clone();
            let value = value.clone();

            async move {
                *backend.hits.lock().unwrap().entry(resource.clone()).or_default() += 1;
                tokio::time::sleep(backend.latency).await;

                if backend.failing.lock().unwrap().contains(&resource) {
                    anyhow::bail!("backend unavailable: {resource}");
                }
                Ok(value)
            }
            .boxed()
        }
    }

    /// Makes every following load of `resource` fail.
    pub fn fail(&self, resource: &str) {
        self.failing.lock().unwrap().insert(resource.to_owned());
    }

    /// Lets `resource` load successfully again.
    pub fn recover(&self, resource: &str) {
        self.failing.lock().unwrap().remove(resource);
    }

    /// Returns how often `resource` was loaded.
    pub fn hits(&self, resource: &str) -> usize {
        self.hits.lock().unwrap().get(resource).copied().unwrap_or(0)
    }

    /// Returns the number of loads across all resources, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the loads of every resource, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

enum Step<T> {
    Respond(T, Duration),
    Fail(String, Duration),
}

/// A fetch function that plays back a fixed sequence of responses.
///
/// Each call takes the next response from the script. Calls past the end of the script fail.
pub struct Script<T> {
    steps: Arc<Mutex<VecDeque<Step<T>>>>,
    calls: Arc<AtomicUsize>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            steps: Default::default(),
            calls: Default::default(),
        }
    }
}

impl<T: Send + 'static> Script<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call that resolves to `value` after `delay`.
    pub fn respond(self, value: T, delay: Duration) -> Self {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step::Respond(value, delay));
        self
    }

    /// Appends a call that fails with `message` after `delay`.
    pub fn fail(self, message: &str, delay: Duration) -> Self {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step::Fail(message.to_owned(), delay));
        self
    }

    pub fn fetch_fn(
        &self,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<T>> + Clone + Send + Sync + 'static + use<T>
    {
        let steps = Arc::clone(&self.steps);
        let calls = Arc::clone(&self.calls);

        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let step = steps.lock().unwrap().pop_front();

            async move {
                match step {
                    Some(Step::Respond(value, delay)) => {
                        tokio::time::sleep(delay).await;
                        Ok(value)
                    }
                    Some(Step::Fail(message, delay)) => {
                        tokio::time::sleep(delay).await;
                        Err(anyhow::anyhow!(message))
                    }
                    None => Err(anyhow::anyhow!("script exhausted at call {call}")),
                }
            }
            .boxed()
        }
    }

    /// Returns how often the fetch function was called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
