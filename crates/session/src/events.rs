//! Broadcast fan-out for relay events.
//!
//! Subscribers hold a [`Subscription`] handle; dropping it removes the
//! underlying channel from the bus, so listeners cannot leak.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Fan-out bus. Cloning is cheap and all clones share subscribers.
pub struct EventBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
}

struct BusInner<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new subscriber. On a closed bus the returned
    /// subscription yields `None` immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            bus: Arc::clone(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Drops every subscriber channel. Pending receivers drain and
    /// then observe end of stream.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

impl<T: Clone> EventBus<T> {
    /// Delivers `event` to every live subscriber, pruning any whose
    /// receiver has gone away.
    pub fn publish(&self, event: T) {
        let mut inner = self.lock();
        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

/// Receiving end of an [`EventBus`] registration. Dropping it
/// unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    bus: Arc<Mutex<BusInner<T>>>,
}

impl<T> Subscription<T> {
    /// Waits for the next event. Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut inner = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.remove(&self.id);
    }
}
