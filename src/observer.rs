use crate::protocol::SequencedMessage;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E, bool, Option<&SequencedMessage>) + Send + Sync + 'static>;
type Registry<E> = Mutex<BTreeMap<u32, Callback<E>>>;

/// Subscription registry for a single event kind.
///
/// Callbacks are invoked synchronously, in registration order, with the event payload, a flag
/// telling whether the change originated on this replica, and the sequenced message that carried
/// it (`None` for purely local mutations that have not round-tripped yet).
pub struct Observer<E> {
    seq: AtomicU32,
    callbacks: Arc<Registry<E>>,
}

impl<E> Default for Observer<E> {
    fn default() -> Self {
        Observer {
            seq: AtomicU32::new(0),
            callbacks: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<E: 'static> Observer<E> {
    /// Subscribes a callback function to this event kind.
    ///
    /// Returns a [Subscription], which will unsubscribe the callback when dropped.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&E, bool, Option<&SequencedMessage>) + Send + Sync + 'static,
    {
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().insert(id, Arc::new(f));
        let weak = Arc::downgrade(&self.callbacks);
        Subscription::new(move || {
            if let Some(registry) = Weak::upgrade(&weak) {
                registry.lock().unwrap().remove(&id);
            }
        })
    }

    /// Invokes all subscribed callbacks with the given event.
    ///
    /// The callback set is snapshotted up front, so callbacks may subscribe or unsubscribe
    /// without deadlocking; such changes only take effect for the next trigger.
    pub fn trigger(&self, event: &E, local: bool, message: Option<&SequencedMessage>) {
        let snapshot: Vec<Callback<E>> = self.callbacks.lock().unwrap().values().cloned().collect();
        for callback in snapshot {
            callback(event, local, message);
        }
    }
}

/// Subscription handle returned from observe methods. Dropping it unsubscribes the callback.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F: FnOnce() + Send + Sync + 'static>(cancel: F) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detaches the subscription, leaving the callback registered for as long as its event
    /// source lives.
    pub fn forget(mut self) {
        self.cancel.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
