//! Bounded multi-producer / multi-consumer buffer that drops the oldest
//! item when full and counts every loss.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;
use tracing::trace;

use crate::telemetry;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

#[derive(Debug)]
pub struct MessageQueue<T> {
    items: ArrayQueue<T>,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue, evicting the oldest item on overflow. Returns `true` if an
    /// item was dropped to make room.
    pub fn push(&self, item: T) -> bool {
        let displaced = self.items.force_push(item).is_some();
        if displaced {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!(telemetry::MESSAGES_DROPPED).increment(1);
            trace!(total_dropped = total, "queue full, dropped oldest");
        }
        self.notify.notify_one();
        displaced
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Wait for the next item. Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.items.len());
        while let Some(item) = self.items.pop() {
            out.push(item);
        }
        out
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
