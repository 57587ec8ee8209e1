//! Foreground focus notifications.
//!
//! The embedding application calls [`FocusEvents::notify_focus`] whenever it regains focus.
//! Interested parties [`register`](FocusEvents::register) a callback and keep the returned
//! [`FocusRegistration`] alive for as long as they want to be notified.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type FocusCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, FocusCallback>>,
}

/// A registry of callbacks to run when the application regains focus.
#[derive(Clone, Default)]
pub struct FocusEvents {
    listeners: Arc<Listeners>,
}

impl fmt::Debug for FocusEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusEvents")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl FocusEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` to be run on every focus event.
    ///
    /// The callback is unregistered once the returned [`FocusRegistration`] is dropped.
    #[must_use = "dropping the registration unregisters the callback"]
    pub fn register<F>(&self, callback: F) -> FocusRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .callbacks
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));

        FocusRegistration {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Runs all registered callbacks.
    ///
    /// Callbacks are run outside of the registry lock, so they may register or unregister
    /// listeners themselves.
    pub fn notify_focus(&self) {
        let callbacks: Vec<_> = self
            .listeners
            .callbacks
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();

        tracing::debug!(listeners = callbacks.len(), "Application regained focus");
        metric!(counter("focus.events") += 1);

        for callback in callbacks {
            callback();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.callbacks.lock().unwrap().len()
    }
}

/// Keeps a focus callback registered. Dropping it unregisters the callback.
pub struct FocusRegistration {
    listeners: Weak<Listeners>,
    id: u64,
}

impl fmt::Debug for FocusRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for FocusRegistration {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.callbacks.lock().unwrap().remove(&self.id);
        }
    }
}
