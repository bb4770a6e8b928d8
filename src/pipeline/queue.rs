//! Bounded queue that evicts its oldest item on overflow
//!
//! Used between the sender stages where stale data is worth less than fresh
//! data: pushing never blocks the producer, the consumer always gets items in
//! the order they were pushed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

/// Multi-producer, single-consumer drop-oldest queue
pub struct DropOldestQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                evicted: 0,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        })
    }

    // A poisoned lock only means another holder panicked mid-push; the deque
    // itself is still consistent, so keep using it.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Push an item, returning the item evicted to make room (if any).
    /// After `close` the item is handed back instead.
    pub fn push(&self, item: T) -> Result<Option<T>, T> {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(item);
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.evicted += 1;
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Wait for the next item; `None` once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait until an item is available or the queue is closed, without taking it
    pub async fn ready(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.lock();
                if !inner.items.is_empty() || inner.closed {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting items; queued items still drain
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Discard everything queued, returning how many items were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.items.len();
        inner.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted by overflow since creation
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_evicts_oldest() {
        let q = DropOldestQueue::new(3);
        for i in 0..3 {
            assert_eq!(q.push(i).unwrap(), None);
        }
        assert_eq!(q.push(3).unwrap(), Some(0));
        assert_eq!(q.push(4).unwrap(), Some(1));
        assert_eq!(q.len(), q.capacity());
        assert_eq!(q.evicted(), 2);
        assert_eq!(q.try_pop(), Some(2));
    }

    #[test]
    fn test_delivered_sequence_never_decreases() {
        // Producer outruns the consumer in bursts; every delivered item must
        // be newer than the previous one whatever got evicted in between.
        let q = DropOldestQueue::new(5);
        let mut delivered = Vec::new();
        let mut seq = 0u64;
        for round in 0..200u64 {
            for _ in 0..(round % 9) {
                let _ = q.push(seq);
                seq += 1;
            }
            for _ in 0..(round % 4) {
                if let Some(s) = q.try_pop() {
                    delivered.push(s);
                }
            }
        }
        while let Some(s) = q.try_pop() {
            delivered.push(s);
        }

        assert!(!delivered.is_empty());
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(delivered.last().copied(), Some(seq - 1));
    }

    #[tokio::test]
    async fn test_pop_waits_and_drains_after_close() {
        let q = DropOldestQueue::new(2);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(v) = q.pop().await {
                    got.push(v);
                }
                got
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.close();
        assert_eq!(q.push(3), Err(3));

        let got = consumer.await.unwrap();
        assert!(got.ends_with(&[2]));
        assert!(q.is_closed());
    }
}
