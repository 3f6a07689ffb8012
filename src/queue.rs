//! FIFO handoff between producer and consumer tasks
//!
//! Producers never block: `push` either appends or, when a capacity has been
//! configured, fails with [`LinkError::QueueFull`]. Nothing is dropped
//! silently. Consumers await `pop`, which is cancel-safe and can therefore sit
//! inside a `tokio::select!` next to a shutdown signal.

use crate::{LinkError, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
    capacity: Option<usize>,
}

impl<T> MessageQueue<T> {
    /// Unbounded queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            capacity: None,
        }
    }

    /// Queue that rejects pushes beyond `capacity` items
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            available: Notify::new(),
            capacity: Some(capacity),
        }
    }

    /// Build from an optional capacity, unbounded when `None`
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Self::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, item: T) -> Result<()> {
        {
            let mut items = self.lock();
            if let Some(capacity) = self.capacity {
                if items.len() >= capacity {
                    return Err(LinkError::QueueFull(capacity));
                }
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Put an item back at the head, ahead of everything queued.
    ///
    /// Used to retry a message whose write failed; ignores the capacity so a
    /// requeue can never lose the item.
    pub fn push_front(&self, item: T) {
        self.lock().push_front(item);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait for the next item.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Wait up to `timeout` for the next item.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pop()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Remove and return everything queued.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
