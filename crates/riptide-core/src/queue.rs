//! Bounded, deduplicating key queue.
//!
//! Holds keys that have been notified but not yet picked up by a
//! worker. A key is in the in-flight set exactly while it sits in the
//! queue, so a key notified again before it is dequeued is dropped
//! instead of queued twice. Producers never block: a full queue rejects
//! the key.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Result of offering a key to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// The key is already queued.
    Duplicate,
    /// The queue is at capacity.
    Full,
    /// The queue has been closed.
    Closed,
}

struct Inner {
    queue: VecDeque<Bytes>,
    in_flight: HashSet<Bytes>,
    closed: bool,
}

pub struct InFlightQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
}

impl InFlightQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                in_flight: HashSet::new(),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Offers a key without waiting.
    pub fn try_enqueue(&self, key: Bytes) -> Offer {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Offer::Closed;
            }
            if inner.in_flight.contains(&key) {
                return Offer::Duplicate;
            }
            if inner.queue.len() >= self.capacity {
                return Offer::Full;
            }
            inner.in_flight.insert(key.clone());
            inner.queue.push_back(key);
        }
        self.notify.notify_one();
        Offer::Accepted
    }

    /// Takes the oldest key, if any, without waiting.
    pub fn try_dequeue(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let key = inner.queue.pop_front()?;
        inner.in_flight.remove(&key);
        Some(key)
    }

    /// Takes the oldest key, waiting up to `timeout` for one to arrive.
    /// Returns `None` on timeout or when the queue is closed and empty.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent enqueue is not missed
            notified.as_mut().enable();

            if let Some(key) = self.try_dequeue() {
                return Some(key);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue();
            }
        }
    }

    /// Closes the queue: queued keys are discarded, the in-flight set is
    /// cleared and every waiting consumer wakes up.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.queue.clear();
            inner.in_flight.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().in_flight.contains(key)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
