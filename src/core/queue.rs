//! Bounded mailbox feeding a single-writer worker.
//!
//! Ingress uses `try_put` and surfaces a full queue to the caller as
//! backpressure instead of blocking. Control items (timer ticks, TTL
//! checks, stop) use `put` and bypass the capacity so the worker can always
//! be reached.

use tokio::sync::Notify;
use std::collections::VecDeque;
use std::sync::Mutex;

/// The queue was disposed while an operation was in flight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Disposed;

impl std::fmt::Display for Disposed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item queue disposed")
    }
}

impl std::error::Error for Disposed {}

struct Inner<T> {
    items: VecDeque<T>,
    disposed: bool,
}

pub struct ItemQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    cap: usize,
}

impl<T> ItemQueue<T> {
    pub fn new(cap: usize) -> Self {
        ItemQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                disposed: false,
            }),
            notify: Notify::new(),
            cap,
        }
    }

    /// Append unless full. `Ok(false)` means the caller must hold back.
    pub fn try_put(&self, item: T) -> Result<bool, Disposed> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return Err(Disposed);
        }
        if inner.items.len() >= self.cap {
            return Ok(false);
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Append regardless of capacity. Control items only.
    pub fn put(&self, item: T) -> Result<(), Disposed> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return Err(Disposed);
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().unwrap().disposed
    }

    /// Wait until the queue has items or is disposed.
    pub async fn wait_items(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().unwrap();
                if !inner.items.is_empty() || inner.disposed {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Mark disposed and drain whatever was pending.
    pub fn dispose(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.disposed = true;
        let items = inner.items.drain(..).collect();
        drop(inner);
        self.notify.notify_waiters();
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_put_respects_capacity() {
        let q = ItemQueue::new(2);
        assert_eq!(q.try_put(1), Ok(true));
        assert_eq!(q.try_put(2), Ok(true));
        assert_eq!(q.try_put(3), Ok(false));
        // Control put bypasses the cap.
        q.put(4).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.try_put(5), Ok(true));
    }

    #[test]
    fn test_dispose_drains_and_rejects() {
        let q = ItemQueue::new(4);
        q.put(1).unwrap();
        q.put(2).unwrap();
        let pending = q.dispose();
        assert_eq!(pending, vec![1, 2]);
        assert!(q.is_disposed());
        assert_eq!(q.try_put(3), Err(Disposed));
        assert_eq!(q.put(3), Err(Disposed));
    }

    #[tokio::test]
    async fn test_wait_items_wakes_on_put() {
        let q = std::sync::Arc::new(ItemQueue::new(4));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.wait_items().await;
            q2.pop()
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        q.put(7).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_wait_items_wakes_on_dispose() {
        let q = std::sync::Arc::new(ItemQueue::<u32>::new(4));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.wait_items().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        q.dispose();
        waiter.await.unwrap();
    }
}
