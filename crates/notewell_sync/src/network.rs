//! Network connectivity monitor abstraction.
//!
//! Both sync subsystems gate their remote operations on the current
//! connectivity state and react to transitions. The platform shells supply
//! the real implementation (browser online events, native reachability);
//! [`ToggleMonitor`] is a switchable implementation for tests and
//! development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked with the new connectivity state on every transition.
pub type OnlineCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Abstraction over the platform's connectivity signal.
pub trait NetworkMonitor: Send + Sync {
    /// Current connectivity state.
    fn is_online(&self) -> bool;

    /// Register a callback for connectivity transitions.
    ///
    /// The callback stays registered until the returned subscription is
    /// dropped or explicitly unsubscribed.
    fn subscribe(&self, callback: OnlineCallback) -> MonitorSubscription;
}

/// Handle to a registered connectivity callback.
///
/// Unsubscribes on drop.
pub struct MonitorSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl MonitorSubscription {
    /// Wrap an unsubscribe closure.
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Explicitly remove the callback registration.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for MonitorSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for MonitorSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Switchable in-memory connectivity monitor.
///
/// Used by tests and development builds to simulate going offline and back.
#[derive(Clone, Default)]
pub struct ToggleMonitor {
    online: Arc<AtomicBool>,
    subscribers: Arc<Mutex<HashMap<u64, OnlineCallback>>>,
    next_id: Arc<AtomicU64>,
}

impl ToggleMonitor {
    /// Create a monitor that starts online.
    pub fn online() -> Self {
        let monitor = Self::default();
        monitor.online.store(true, Ordering::SeqCst);
        monitor
    }

    /// Create a monitor that starts offline.
    pub fn offline() -> Self {
        Self::default()
    }

    /// Flip the connectivity state, notifying all subscribers on change.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        // Snapshot the callbacks so notifications run without the lock held;
        // a callback may subscribe or unsubscribe re-entrantly.
        let callbacks: Vec<OnlineCallback> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.values().cloned().collect()
        };
        for callback in callbacks {
            callback(online);
        }
    }
}

impl NetworkMonitor for ToggleMonitor {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self, callback: OnlineCallback) -> MonitorSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(id, callback);

        let subscribers = Arc::clone(&self.subscribers);
        MonitorSubscription::new(move || {
            subscribers.lock().unwrap().remove(&id);
        })
    }
}

impl std::fmt::Debug for ToggleMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToggleMonitor")
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}
