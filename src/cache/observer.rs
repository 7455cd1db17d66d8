//! Lifecycle notifications
//!
//! Observers hear about pins, unpins and commits once the filesystem step and the index
//! update have both succeeded.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

/// Cache lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Pinned {
        resource_id: String,
        content_hash: String,
    },
    Unpinned {
        resource_id: String,
        content_hash: String,
    },
    /// A dirty file was queued for upload
    Committed { resource_id: String },
}

/// Receives cache lifecycle events
///
/// Called on the cache worker, so implementations should hand work off rather than block.
pub trait CacheObserver: Send + Sync {
    fn on_cache_event(&self, event: &CacheEvent);
}

/// Relays events to the owner over a channel
impl CacheObserver for mpsc::UnboundedSender<CacheEvent> {
    fn on_cache_event(&self, event: &CacheEvent) {
        // Receiver gone means the owner stopped listening
        let _ = self.send(event.clone());
    }
}

/// Shared list of registered observers
#[derive(Clone, Default)]
pub struct ObserverList {
    observers: Arc<RwLock<Vec<Arc<dyn CacheObserver>>>>,
}

impl ObserverList {
    pub fn add(&self, observer: Arc<dyn CacheObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Remove by identity; returns whether it was registered
    pub fn remove(&self, observer: &Arc<dyn CacheObserver>) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn notify(&self, event: &CacheEvent) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        trace!(event = ?event, observers = observers.len(), "Notifying cache observers");
        for observer in observers.iter() {
            observer.on_cache_event(event);
        }
    }
}
