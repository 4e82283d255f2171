//! Bounded queues of opaque capacity tokens.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};

/// One unit of admission capacity. Tokens carry no identity and are
/// interchangeable across a queue.
#[derive(Debug)]
pub(crate) struct Capacity;

/// A bounded multi-producer/multi-consumer queue of [`Capacity`] tokens.
///
/// Clones share the same underlying channel, so a queue handle can be held
/// by the limiter, by outstanding guards, and by background transfer tasks
/// at the same time. `len == capacity` means every token is home;
/// `len == 0` means every token is outstanding with a caller.
#[derive(Debug, Clone)]
pub(crate) struct CapacityQueue {
    tx: Sender<Capacity>,
    rx: Receiver<Capacity>,
}

impl CapacityQueue {
    /// Create an empty queue able to hold `cap` tokens. `cap` must be at
    /// least 1; the limiter validates its configuration before building
    /// queues.
    pub(crate) fn bounded(cap: usize) -> Self {
        let (tx, rx) = async_channel::bounded(cap);
        Self { tx, rx }
    }

    /// Create a queue of `cap` tokens with every token present.
    pub(crate) fn filled(cap: usize) -> Self {
        let queue = Self::bounded(cap);
        for _ in 0..cap {
            // Cannot fail: the queue was just created with exactly `cap` slots.
            let _ = queue.try_put(Capacity);
        }
        queue
    }

    /// Take a token without waiting. Returns `None` when the queue is empty.
    pub(crate) fn try_take(&self) -> Option<Capacity> {
        match self.rx.try_recv() {
            Ok(token) => Some(token),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Take a token, suspending until one is available. Cancel-safe: a
    /// dropped future consumes nothing.
    pub(crate) async fn take(&self) -> Capacity {
        self.rx
            .recv()
            .await
            .expect("queue holds both channel endpoints, channel cannot close")
    }

    /// Return a token, suspending until a slot is free.
    pub(crate) async fn put(&self, token: Capacity) {
        self.tx
            .send(token)
            .await
            .expect("queue holds both channel endpoints, channel cannot close");
    }

    /// Return a token without waiting. `false` means the queue was already
    /// full and the token was not accepted.
    pub(crate) fn try_put(&self, token: Capacity) -> bool {
        match self.tx.try_send(token) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => false,
        }
    }

    /// Number of tokens currently in the queue.
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    /// Maximum number of tokens the queue can hold.
    pub(crate) fn capacity(&self) -> usize {
        self.rx
            .capacity()
            .expect("queue channels are always bounded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_take_on_empty_returns_none() {
        let queue = CapacityQueue::bounded(2);
        assert!(queue.try_take().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn filled_queue_starts_full() {
        let queue = CapacityQueue::filled(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.capacity(), 3);
    }

    #[test]
    fn try_put_on_full_queue_is_refused() {
        let queue = CapacityQueue::filled(1);
        assert!(!queue.try_put(Capacity));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn take_waits_for_a_token() {
        let queue = CapacityQueue::bounded(1);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        queue.put(Capacity).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("take should complete once a token arrives")
            .expect("take task should not panic");
    }

    #[tokio::test]
    async fn tokens_move_between_clones() {
        let queue = CapacityQueue::filled(2);
        let other = queue.clone();
        let token = other.try_take().expect("token available");
        assert_eq!(queue.len(), 1);
        assert!(queue.try_put(token));
        assert_eq!(other.len(), 2);
    }
}
