//! Bounded drop-oldest queue bridging sync producers and async consumers.
//!
//! Used in two places with the same overflow policy:
//! - audio frames (capture thread → recognizer backend), capacity 32
//! - per-client caption board outboxes, capacity 32
//!
//! On overflow the **oldest** entry is discarded and a counter incremented;
//! a fresh frame or caption is always worth more than a stale one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Cloneable handle to a bounded drop-oldest queue.
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DropOldestQueue<T> {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Push an item, discarding the oldest entry when full.
    ///
    /// Safe to call from a non-async thread. Returns `false` if the queue is
    /// closed (the item is discarded).
    pub fn push(&self, item: T) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() == self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.inner.notify.notify_one();
        true
    }

    /// Await the next item. Returns `None` once the queue is closed *and*
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Arm the notification before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if let Some(item) = self.inner.queue.lock().pop_front() {
                return Some(item);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.queue.lock().pop_front()
    }

    /// Close the queue: producers become no-ops, consumers drain then get `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries discarded to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
