use std::collections::VecDeque;
use tokio::sync::{Mutex as AsyncMutex, Notify};

#[derive(Debug)]
struct FifoQueueState<T> {
    deque: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO feeding the single decision worker. Push blocks when full:
/// the pipeline must never drop or reorder a submission, so backpressure is
/// the only overflow behavior.
#[derive(Debug)]
pub struct FifoQueue<T> {
    state: AsyncMutex<FifoQueueState<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> FifoQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: AsyncMutex::new(FifoQueueState {
                deque: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Returns false when the queue is closed.
    pub async fn push(&self, item: T) -> bool {
        let mut pending = Some(item);
        loop {
            let mut guard = self.state.lock().await;
            if guard.closed {
                return false;
            }
            if guard.deque.len() < self.capacity {
                guard
                    .deque
                    .push_back(pending.take().expect("pending item exists before enqueue"));
                drop(guard);
                self.not_empty.notify_one();
                return true;
            }
            drop(guard);
            self.not_full.notified().await;
        }
    }

    pub async fn pop(&self) -> Option<T> {
        loop {
            let mut guard = self.state.lock().await;
            if let Some(item) = guard.deque.pop_front() {
                drop(guard);
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            drop(guard);
            self.not_empty.notified().await;
        }
    }

    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        guard.closed = true;
        drop(guard);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = FifoQueue::new(8);
        assert!(queue.push(1).await);
        assert!(queue.push(2).await);
        assert!(queue.push(3).await);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = FifoQueue::new(8);
        assert!(queue.push(7).await);
        queue.close().await;
        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
        assert!(!queue.push(8).await, "push after close is refused");
    }

    #[tokio::test]
    async fn full_queue_blocks_until_pop() {
        use std::sync::Arc;
        let queue = Arc::new(FifoQueue::new(1));
        assert!(queue.push(1).await);

        let pusher = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(queue.pop().await, Some(1));
        assert!(pusher.await.expect("pusher join"));
        assert_eq!(queue.pop().await, Some(2));
    }
}
