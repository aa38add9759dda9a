//! Multi-subscriber observer lists with unsubscription handles.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    observers: Vec<(u64, Observer<T>)>,
}

/// An ordered list of observers for one kind of event.
///
/// `emit` snapshots the list before calling out, so an observer may subscribe
/// or unsubscribe from inside its own callback; the change applies from the
/// next emit.
pub struct EventEmitter<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("observers", &self.registry.lock().observers.len())
            .finish()
    }
}

impl<T: 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.observers.push((id, Arc::new(observer)));
            id
        };
        let registry = Arc::downgrade(&self.registry);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().observers.retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Observer<T>> = self
            .registry
            .lock()
            .observers
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in snapshot {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.registry.lock().observers.clear();
    }
}

/// Handle returned by [`EventEmitter::subscribe`].
///
/// Dropping the handle keeps the observer registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription keeps the observer registered forever"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}
