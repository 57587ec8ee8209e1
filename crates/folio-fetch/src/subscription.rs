//! Reactive subscriptions to fetched resources.
//!
//! A [`Fetcher`] is created once per process and hands out [`Subscription`]s. Each subscription
//! owns the state of one consumer of a resource and moves through
//! `Idle -> Loading -> {Success, Error}`. It enters `Loading` when it is mounted, when its
//! dependencies change, on an explicit [`refetch`](Subscription::refetch), and when the
//! application regains focus while its data is stale.
//!
//! Every fetch is tagged with the generation of the subscription at the time it started. Starting
//! another fetch, or tearing the subscription down, bumps the generation. Results of fetches that
//! no longer hold the latest generation are discarded, so results are never applied out of order.
//!
//! Fetches go through the shared [`Coalescer`], and results are written to the shared
//! [`TtlCache`] when the subscription has a cache key. Cancelling a subscription's fetch only
//! stops that subscription from listening; other subscriptions waiting for the same request are
//! not affected.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::caching::{CacheKey, CacheStats, KeyPattern, TtlCache};
use crate::coalesce::Coalescer;
use crate::config::{Config, FetchConfig};
use crate::error::FetchError;
use crate::focus::{FocusEvents, FocusRegistration};

type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

fn boxed_fetch_fn<T, F, Fut>(fetch_fn: F) -> FetchFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move || fetch_fn().boxed())
}

/// The process-wide entry point for fetching resources.
///
/// Holds the shared [`TtlCache`], [`Coalescer`] and [`FocusEvents`]. Create it once and share it
/// by reference or behind an [`Arc`].
pub struct Fetcher {
    cache: Arc<TtlCache>,
    coalescer: Coalescer,
    focus: FocusEvents,
    defaults: FetchConfig,
    next_subscription: AtomicU64,
    _sweeper: Option<DropGuard>,
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache", &self.cache)
            .field("coalescer", &self.coalescer)
            .field("focus", &self.focus)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Fetcher {
    /// Creates a fetcher with fresh shared state, configured from `config`.
    ///
    /// If a `cache.sweep_interval` is configured, this spawns the cache sweeper and thus needs to
    /// be called from within a tokio runtime. The sweeper stops when the fetcher is dropped.
    pub fn new(config: &Config) -> Self {
        let cache = Arc::new(TtlCache::new());

        let sweeper = config.cache.sweep_interval.map(|interval| {
            let token = CancellationToken::new();
            cache.spawn_sweeper(interval, token.clone());
            token.drop_guard()
        });

        Self {
            cache,
            coalescer: Coalescer::new(),
            focus: FocusEvents::new(),
            defaults: config.fetch,
            next_subscription: AtomicU64::new(0),
            _sweeper: sweeper,
        }
    }

    /// Creates a fetcher around existing shared state.
    pub fn with_parts(
        cache: Arc<TtlCache>,
        coalescer: Coalescer,
        focus: FocusEvents,
        defaults: FetchConfig,
    ) -> Self {
        Self {
            cache,
            coalescer,
            focus,
            defaults,
            next_subscription: AtomicU64::new(0),
            _sweeper: None,
        }
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    /// The focus events subscriptions listen to.
    ///
    /// The application calls [`FocusEvents::notify_focus`] on this when it regains focus.
    pub fn focus_events(&self) -> &FocusEvents {
        &self.focus
    }

    /// Subscribes to the resource produced by `fetch_fn`.
    ///
    /// Unless disabled via `options`, the first fetch starts right away. `dependencies` are the
    /// values the result of `fetch_fn` depends on; see [`Subscription::update`].
    ///
    /// This has to be called from within a tokio runtime.
    pub fn subscribe<T, F, Fut>(
        &self,
        fetch_fn: F,
        dependencies: serde_json::Value,
        options: SubscribeOptions,
    ) -> Subscription<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let options = options.resolve(&self.defaults);
        tracing::trace!(id, cache_key = ?options.cache_key, "Creating subscription");
        metric!(counter("subscription.created") += 1);

        let (state, receiver) = watch::channel(FetchState::default());
        let inner = Arc::new(Inner {
            id,
            cache: Arc::clone(&self.cache),
            coalescer: self.coalescer.clone(),
            focus: self.focus.clone(),
            defaults: self.defaults,
            state,
            generation: AtomicU64::new(0),
            control: Mutex::new(Control {
                fetch_fn: boxed_fetch_fn(fetch_fn),
                dependencies,
                options,
                last_fetched: None,
                task: None,
                focus: None,
                torn_down: false,
            }),
        });

        inner.sync_focus_registration();
        inner.start_fetch(Trigger::Mount);

        Subscription { inner, receiver }
    }

    /// Removes the cached value for `key`.
    pub fn invalidate(&self, key: impl AsRef<str>) {
        self.cache.invalidate(key)
    }

    /// Removes all cached values whose key matches `pattern`, returning how many were removed.
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        self.cache.invalidate_pattern(pattern)
    }

    pub fn clear(&self) {
        self.cache.clear()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Per-subscription options.
///
/// Settings left at `None` fall back to the [`FetchConfig`] of the [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Stores and looks up results in the shared cache under this key.
    pub cache_key: Option<CacheKey>,
    /// Coalesces concurrent fetches under this key.
    ///
    /// Defaults to the cache key. Without either, fetches are only coalesced within the
    /// subscription itself.
    pub request_key: Option<String>,
    /// How long a fetched result stays in the cache.
    pub cache_ttl: Option<Duration>,
    /// How long a fetched result is considered fresh.
    pub stale_time: Option<Duration>,
    /// A disabled subscription stays idle and never fetches.
    pub enabled: bool,
    /// Whether to refetch stale data when the application regains focus.
    pub refetch_on_window_focus: Option<bool>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            cache_key: None,
            request_key: None,
            cache_ttl: None,
            stale_time: None,
            enabled: true,
            refetch_on_window_focus: None,
        }
    }
}

impl SubscribeOptions {
    /// Options for a subscription that caches its results under `cache_key`.
    pub fn cached(cache_key: CacheKey) -> Self {
        Self {
            cache_key: Some(cache_key),
            ..Default::default()
        }
    }

    fn resolve(self, defaults: &FetchConfig) -> ResolvedOptions {
        ResolvedOptions {
            cache_key: self.cache_key,
            request_key: self.request_key,
            cache_ttl: self.cache_ttl.unwrap_or(defaults.cache_ttl),
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            enabled: self.enabled,
            refetch_on_window_focus: self
                .refetch_on_window_focus
                .unwrap_or(defaults.refetch_on_window_focus),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedOptions {
    cache_key: Option<CacheKey>,
    request_key: Option<String>,
    cache_ttl: Duration,
    stale_time: Duration,
    enabled: bool,
    refetch_on_window_focus: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The subscription is disabled and has not fetched anything.
    Idle,
    Loading,
    Success,
    Error,
}

/// A snapshot of the state of a [`Subscription`].
pub struct FetchState<T> {
    pub status: FetchStatus,
    /// The last successfully fetched value.
    ///
    /// It is kept when a later fetch fails, so consumers can keep showing it alongside the error.
    pub data: Option<Arc<T>>,
    /// The error of the last fetch, cleared by the next successful one.
    pub error: Option<FetchError>,
    /// Whether a fetch is outstanding for this subscription.
    pub loading: bool,
    /// When the current data was last fetched from the backend.
    pub last_fetched: Option<Instant>,
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self {
            status: FetchStatus::Idle,
            data: None,
            error: None,
            loading: false,
            last_fetched: None,
        }
    }
}

impl<T> Clone for FetchState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            loading: self.loading,
            last_fetched: self.last_fetched,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for FetchState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchState")
            .field("status", &self.status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("loading", &self.loading)
            .field("last_fetched", &self.last_fetched)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Mount,
    Dependencies,
    Refetch,
    Focus,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Dependencies => "dependencies",
            Self::Refetch => "refetch",
            Self::Focus => "focus",
        }
    }

    /// Focus refetches only happen for stale data and always go to the backend.
    fn bypasses_cache(self) -> bool {
        matches!(self, Self::Focus)
    }
}

struct Control<T> {
    fetch_fn: FetchFn<T>,
    dependencies: serde_json::Value,
    options: ResolvedOptions,
    last_fetched: Option<Instant>,
    /// Waits for the outstanding fetch, if any. Might already be finished.
    task: Option<JoinHandle<()>>,
    focus: Option<FocusRegistration>,
    torn_down: bool,
}

impl<T> Control<T> {
    fn is_stale(&self) -> bool {
        match self.last_fetched {
            Some(last_fetched) => last_fetched.elapsed() > self.options.stale_time,
            None => true,
        }
    }

    fn request_key(&self, id: u64) -> String {
        match (&self.options.request_key, &self.options.cache_key) {
            (Some(request_key), _) => request_key.clone(),
            (None, Some(cache_key)) => cache_key.to_string(),
            (None, None) => format!("anonymous:{id}:{}", self.dependencies),
        }
    }

    /// Stops waiting for the outstanding fetch.
    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Inner<T> {
    id: u64,
    cache: Arc<TtlCache>,
    coalescer: Coalescer,
    focus: FocusEvents,
    defaults: FetchConfig,
    state: watch::Sender<FetchState<T>>,
    generation: AtomicU64,
    control: Mutex<Control<T>>,
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Transitions into `Loading`, superseding any outstanding fetch.
    fn start_fetch(self: &Arc<Self>, trigger: Trigger) {
        let mut control = self.control.lock().unwrap();
        if control.torn_down || !control.options.enabled {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        control.cancel_task();

        tracing::debug!(
            id = self.id,
            generation,
            trigger = trigger.as_str(),
            "Starting fetch"
        );
        metric!(counter("subscription.fetch") += 1, "trigger" => trigger.as_str());

        // A fresh subscription, or one with fresh data, is served from the cache.
        if !trigger.bypasses_cache()
            && let Some(cache_key) = &control.options.cache_key
            && (control.last_fetched.is_none() || !control.is_stale())
            && let Some(data) = self.cache.get::<T>(cache_key)
        {
            tracing::trace!(id = self.id, %cache_key, "Serving from cache");
            self.state.send_modify(|state| {
                state.status = FetchStatus::Success;
                state.data = Some(data);
                state.error = None;
                state.loading = false;
            });
            return;
        }

        self.state.send_modify(|state| {
            state.status = FetchStatus::Loading;
            state.loading = true;
        });

        let request_key = control.request_key(self.id);
        let fetch_fn = Arc::clone(&control.fetch_fn);
        drop(control);

        // `fetch_fn` runs outside of the lock, it may well interact with this subscription.
        let request = self.coalescer.request(&request_key, move || fetch_fn());
        let inner = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let result = request.await;
            if let Some(inner) = inner.upgrade()
                && let Err(err) = inner.settle(generation, result)
            {
                tracing::trace!(
                    id = inner.id,
                    generation,
                    error = %err,
                    "Discarding superseded fetch"
                );
                metric!(counter("subscription.discarded") += 1);
            }
        });

        let mut control = self.control.lock().unwrap();
        if control.torn_down || self.generation.load(Ordering::SeqCst) != generation {
            task.abort();
        } else {
            control.task = Some(task);
        }
    }

    /// Applies the outcome of the fetch started with `generation`.
    ///
    /// Nothing is applied if another fetch started since, or the subscription was torn down. The
    /// fetch then counts as [`Cancelled`](FetchError::Cancelled).
    fn settle(
        &self,
        generation: u64,
        result: Result<Arc<T>, FetchError>,
    ) -> Result<(), FetchError> {
        let mut control = self.control.lock().unwrap();
        if control.torn_down || self.generation.load(Ordering::SeqCst) != generation {
            return Err(FetchError::Cancelled);
        }
        control.task = None;

        match result {
            Ok(data) => {
                if let Some(cache_key) = &control.options.cache_key {
                    self.cache
                        .set_shared(cache_key, Arc::clone(&data), control.options.cache_ttl);
                }

                let now = Instant::now();
                control.last_fetched = Some(now);
                self.state.send_modify(|state| {
                    state.status = FetchStatus::Success;
                    state.data = Some(data);
                    state.error = None;
                    state.loading = false;
                    state.last_fetched = Some(now);
                });
            }
            Err(err) => {
                tracing::debug!(id = self.id, error = %err, "Subscription fetch failed");
                self.state.send_modify(|state| {
                    state.status = FetchStatus::Error;
                    state.error = Some(err);
                    state.loading = false;
                });
            }
        }
        Ok(())
    }

    fn on_focus(self: &Arc<Self>) {
        {
            let control = self.control.lock().unwrap();
            if control.torn_down
                || !control.options.enabled
                || !control.options.refetch_on_window_focus
                || self.state.borrow().loading
                || !control.is_stale()
            {
                return;
            }
        }
        self.start_fetch(Trigger::Focus);
    }

    /// Registers for focus events if the options ask for focus refetches, or unregisters.
    fn sync_focus_registration(self: &Arc<Self>) {
        let mut control = self.control.lock().unwrap();
        let wanted = !control.torn_down && control.options.refetch_on_window_focus;

        if wanted && control.focus.is_none() {
            let inner = Arc::downgrade(self);
            control.focus = Some(self.focus.register(move || {
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.on_focus();
                }
            }));
        } else if !wanted {
            control.focus = None;
        }
    }
}

impl<T> Inner<T> {
    /// Cancels the outstanding fetch without starting a new one.
    fn cancel(&self, control: &mut Control<T>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        control.cancel_task();
    }

    /// Cancels the outstanding fetch of a subscription that just got disabled.
    fn disable(&self, control: &mut Control<T>) {
        self.cancel(control);
        self.state.send_if_modified(|state| {
            if !state.loading {
                return false;
            }
            state.loading = false;
            state.status = match (&state.data, &state.error) {
                (_, Some(_)) => FetchStatus::Error,
                (Some(_), None) => FetchStatus::Success,
                (None, None) => FetchStatus::Idle,
            };
            true
        });
    }

    fn teardown(&self) {
        let focus = {
            let mut control = self.control.lock().unwrap();
            if control.torn_down {
                return;
            }
            control.torn_down = true;
            self.cancel(&mut control);
            control.focus.take()
        };
        // Unregister outside of our own lock, the registry might be running our callback.
        drop(focus);

        tracing::trace!(id = self.id, "Subscription torn down");
        metric!(counter("subscription.torn_down") += 1);
    }
}

/// A consumer's view of a fetched resource.
///
/// The subscription is torn down when dropped or [`unsubscribe`](Self::unsubscribe)d. After that,
/// its state does not change anymore.
pub struct Subscription<T> {
    inner: Arc<Inner<T>>,
    receiver: watch::Receiver<FetchState<T>>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.receiver.borrow();
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("loading", &state.loading)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Subscription<T> {
    /// Returns the current state.
    pub fn state(&self) -> FetchState<T> {
        self.receiver.borrow().clone()
    }

    /// Returns the current data, if any.
    pub fn data(&self) -> Option<Arc<T>> {
        self.receiver.borrow().data.clone()
    }

    /// Returns a receiver that observes all state changes.
    pub fn watch(&self) -> watch::Receiver<FetchState<T>> {
        self.inner.state.subscribe()
    }

    /// Waits for the next state change and returns the new state.
    ///
    /// Returns the current state right away once the subscription is torn down.
    pub async fn changed(&mut self) -> FetchState<T> {
        if !self.is_torn_down() {
            // The sender lives as long as `self`, so this only returns once something changed.
            self.receiver.changed().await.ok();
        }
        self.receiver.borrow_and_update().clone()
    }

    /// Waits until no fetch is outstanding and returns the state at that point.
    ///
    /// Returns right away if the subscription is not loading or was torn down. The state of a
    /// torn down subscription is frozen, and may still show the fetch that was dropped.
    pub async fn settled(&mut self) -> FetchState<T> {
        if self.is_torn_down() {
            return self.state();
        }
        if let Ok(state) = self.receiver.wait_for(|state| !state.loading).await {
            return state.clone();
        }
        self.state()
    }

    /// Fetches the resource again.
    ///
    /// Data that is still fresh is served from the cache if possible. There is no automatic
    /// retry after a failure; calling this is the way to retry.
    pub fn refetch(&self) {
        self.inner.start_fetch(Trigger::Refetch);
    }

    /// Whether more than the stale time has passed since the last successful fetch.
    ///
    /// A subscription that never fetched anything is stale.
    pub fn is_stale(&self) -> bool {
        self.inner.control.lock().unwrap().is_stale()
    }

    /// Re-declares the subscription, like [`Fetcher::subscribe`] would.
    ///
    /// The new `fetch_fn` and `options` always replace the current ones. A new fetch starts if
    /// `dependencies` or the cache key differ from the current ones, or if the subscription got
    /// enabled. Disabling the subscription cancels the outstanding fetch.
    pub fn update<F, Fut>(
        &self,
        fetch_fn: F,
        dependencies: serde_json::Value,
        options: SubscribeOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let trigger = {
            let mut control = self.inner.control.lock().unwrap();
            if control.torn_down {
                return;
            }

            let options = options.resolve(&self.inner.defaults);

            let changed = control.dependencies != dependencies
                || control.options.cache_key != options.cache_key
                || control.options.request_key != options.request_key;
            let enabled = !control.options.enabled && options.enabled;
            let disabled = control.options.enabled && !options.enabled;

            control.fetch_fn = boxed_fetch_fn(fetch_fn);
            control.dependencies = dependencies;
            control.options = options;

            if disabled {
                self.inner.disable(&mut control);
            }

            if enabled {
                Some(Trigger::Mount)
            } else if changed {
                Some(Trigger::Dependencies)
            } else {
                None
            }
        };

        self.inner.sync_focus_registration();
        if let Some(trigger) = trigger {
            self.inner.start_fetch(trigger);
        }
    }

    /// Enables or disables fetching, keeping the current fetch function and dependencies.
    ///
    /// Enabling an idle subscription starts a fetch, disabling one cancels its outstanding fetch.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut control = self.inner.control.lock().unwrap();
            if control.torn_down || control.options.enabled == enabled {
                return;
            }
            control.options.enabled = enabled;
            if !enabled {
                self.inner.disable(&mut control);
                return;
            }
        }
        self.inner.start_fetch(Trigger::Mount);
    }

    fn is_torn_down(&self) -> bool {
        self.inner.control.lock().unwrap().torn_down
    }

    /// Tears the subscription down.
    ///
    /// The outstanding fetch is no longer waited for and focus events are not observed anymore.
    /// The state stays as it is from here on.
    pub fn unsubscribe(&self) {
        self.inner.teardown();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
