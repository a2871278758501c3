//! Observable engine state.
//!
//! [`StateHub`] keeps the latest [`OfflineState`] snapshot and pushes every new
//! snapshot to subscribers. [`Listeners`] is the underlying registry and is
//! also used for [`crate::LocalEffect`] subscribers.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::models::OfflineState;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// Registry of callbacks invoked with each published value
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let registry = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .listeners
                        .retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        }
    }

    /// Call every listener with `value`.
    ///
    /// Listeners run outside the registry lock and may subscribe or
    /// unsubscribe re-entrantly.
    pub fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`; dropping it keeps the listener registered
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Latest [`OfflineState`] plus its subscribers
pub struct StateHub {
    current: RwLock<OfflineState>,
    listeners: Listeners<OfflineState>,
}

impl StateHub {
    pub fn new(initial: OfflineState) -> Self {
        Self {
            current: RwLock::new(initial),
            listeners: Listeners::new(),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> OfflineState {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OfflineState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Replace the snapshot and notify subscribers
    pub fn publish(&self, state: OfflineState) {
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            current.clone_from(&state);
        }
        self.listeners.notify(&state);
    }
}
