//! Observer list shared by the transports and the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Handle returned when registering a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// An ordered list of subscribers.
///
/// Notification iterates over a snapshot, so a subscriber may register or
/// remove other subscribers from inside its callback.
pub struct Subscribers<T: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Arc<T>)>>,
}

impl<T: ?Sized> Default for Subscribers<T> {
    fn default() -> Self {
        Self { next_id: AtomicU64::new(1), entries: RwLock::new(Vec::new()) }
    }
}

impl<T: ?Sized> Subscribers<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers are notified in registration order.
    pub fn add(&self, subscriber: Arc<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, subscriber));
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Current subscribers in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.read().iter().map(|(_, s)| Arc::clone(s)).collect()
    }

    /// Invoke `f` once per subscriber.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for subscriber in self.snapshot() {
            f(subscriber.as_ref());
        }
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
