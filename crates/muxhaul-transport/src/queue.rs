//! Bounded FIFO queue with non-blocking admission
//!
//! Producers never wait: `try_push` hands the item back when the queue is full
//! or closed, and the caller decides what to do with it (usually close it).
//! Consumers wait in `pop` until an item arrives or the queue is closed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Rejected push, carrying the item back to the caller
pub enum PushError<T> {
    /// The queue is at capacity
    Full(T),
    /// The queue was closed
    Closed(T),
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("queue is full"),
            PushError::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer queue
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append an item if there is room. Existing entries are never evicted.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() >= self.capacity {
                return Err(PushError::Full(item));
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Put an item back at the head of the queue.
    ///
    /// Used to return an item that was dequeued but not consumed; capacity is
    /// not enforced since the item was already admitted once.
    pub fn push_front(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed(item));
            }
            state.items.push_front(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    ///
    /// Cancel safe: dropping the future never loses an item.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Close the queue, dropping everything still queued, and wake all consumers.
    pub fn close(&self) {
        let discarded = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        drop(discarded);
        self.notify.notify_waiters();
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_try_push_rejects_when_full() {
        let queue = BoundedQueue::new(2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();

        assert!(matches!(queue.try_push(3), Err(PushError::Full(3))));

        // Existing contents are untouched
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.try_push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(queue.pop().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_push_front_is_served_first() {
        let queue = BoundedQueue::new(2);
        queue.try_push("b").unwrap();
        queue.try_push("c").unwrap();

        // Allowed past capacity
        queue.push_front("a").unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().await, Some("a"));
        assert_eq!(queue.pop().await, Some("b"));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(BoundedQueue::new(1));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_push(7).unwrap();

        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_close_discards_and_wakes_consumers() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_and_is_empty() {
        let queue = BoundedQueue::new(4);
        queue.try_push(1).unwrap();
        queue.close();

        assert!(queue.is_empty());
        assert!(matches!(queue.try_push(2), Err(PushError::Closed(2))));
        assert!(matches!(queue.push_front(3), Err(PushError::Closed(3))));
        assert_eq!(queue.pop().await, None);
    }
}
