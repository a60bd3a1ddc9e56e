//! Bounded message queue
//!
//! A FIFO of owned messages shared between threads, with timeouts on both the
//! enqueue side (when the queue is bounded and full) and the dequeue side.
//! The placement of messages is a strategy: the default is plain FIFO, a
//! custom [`Placement`] turns the queue into a priority queue without touching
//! the synchronization logic.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Message placement strategy.
///
/// `enqueue_index` returns the insertion position for a new message,
/// `dequeue_index` the position of the next message to deliver. The defaults
/// implement a plain FIFO (insert at back, remove at front).
pub trait Placement<T>: Send + Sync {
    fn enqueue_index(&self, _msg: &T, queue: &VecDeque<T>) -> usize {
        queue.len()
    }

    fn dequeue_index(&self, _queue: &VecDeque<T>) -> usize {
        0
    }
}

/// Default FIFO placement.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fifo;

impl<T> Placement<T> for Fifo {}

/// Bounded FIFO of owned messages with enqueue/dequeue timeouts.
///
/// A capacity of zero disables the bound: enqueue never waits.
pub struct MessageQueue<T, P: Placement<T> = Fifo> {
    queue: Mutex<VecDeque<T>>,
    enqueued: Condvar,
    dequeued: Condvar,
    capacity: usize,
    placement: P,
}

impl<T: Send> MessageQueue<T, Fifo> {
    /// Create a FIFO queue bounded to `capacity` messages (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self::with_placement(capacity, Fifo)
    }
}

impl<T: Send, P: Placement<T>> MessageQueue<T, P> {
    /// Create a queue with an explicit placement strategy.
    pub fn with_placement(capacity: usize, placement: P) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            enqueued: Condvar::new(),
            dequeued: Condvar::new(),
            capacity,
            placement,
        }
    }

    /// Maximum number of queued messages (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Enqueue a message, waiting up to `timeout` for free space when the
    /// queue is bounded and full. On timeout, the message is handed back so
    /// the caller decides its fate (dropping it destroys it).
    pub fn enqueue(&self, msg: T, timeout: Duration) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if self.capacity != 0 {
            let deadline = Instant::now() + timeout;
            while queue.len() >= self.capacity {
                let now = Instant::now();
                if now >= deadline {
                    return Err(msg);
                }
                self.dequeued.wait_for(&mut queue, deadline - now);
            }
        }
        let index = self.placement.enqueue_index(&msg, &queue);
        let len = queue.len();
        queue.insert(index.min(len), msg);
        self.enqueued.notify_one();
        Ok(())
    }

    /// Enqueue bypassing the capacity bound. Always succeeds; sustained use
    /// beyond the bound is the caller's memory-pressure responsibility.
    pub fn force_enqueue(&self, msg: T) {
        let mut queue = self.queue.lock();
        let index = self.placement.enqueue_index(&msg, &queue);
        let len = queue.len();
        queue.insert(index.min(len), msg);
        self.enqueued.notify_one();
    }

    /// Dequeue a message, waiting up to `timeout` for one to arrive.
    pub fn dequeue(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.queue.lock();
        let deadline = Instant::now() + timeout;
        while queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.enqueued.wait_for(&mut queue, deadline - now);
        }
        let index = self.placement.dequeue_index(&queue).min(queue.len() - 1);
        let msg = queue.remove(index);
        self.dequeued.notify_one();
        msg
    }

    /// Non-consuming access to the message that `dequeue` would deliver next.
    pub fn peek<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let queue = self.queue.lock();
        if queue.is_empty() {
            f(None)
        } else {
            let index = self.placement.dequeue_index(&queue).min(queue.len() - 1);
            f(queue.get(index))
        }
    }

    /// Drop all queued messages.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.clear();
        self.dequeued.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = MessageQueue::new(0);
        q.enqueue(1, Duration::ZERO).unwrap();
        q.enqueue(2, Duration::ZERO).unwrap();
        q.enqueue(3, Duration::ZERO).unwrap();
        assert_eq!(q.dequeue(Duration::ZERO), Some(1));
        assert_eq!(q.dequeue(Duration::ZERO), Some(2));
        assert_eq!(q.dequeue(Duration::ZERO), Some(3));
        assert_eq!(q.dequeue(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_bound_never_exceeded() {
        let q = MessageQueue::new(4);
        for i in 0..4 {
            q.enqueue(i, Duration::ZERO).unwrap();
        }
        assert_eq!(q.enqueue(99, Duration::from_millis(20)), Err(99));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_force_enqueue_bypasses_bound() {
        let q = MessageQueue::new(1);
        q.enqueue(1, Duration::ZERO).unwrap();
        q.force_enqueue(2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_blocking_handoff() {
        let q = Arc::new(MessageQueue::new(1));
        let q2 = q.clone();
        let producer = thread::spawn(move || {
            for i in 0..100 {
                q2.enqueue(i, Duration::from_secs(5)).unwrap();
            }
        });
        let mut got = Vec::new();
        while got.len() < 100 {
            if let Some(v) = q.dequeue(Duration::from_secs(5)) {
                got.push(v);
            }
        }
        producer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_peek_and_clear() {
        let q = MessageQueue::new(0);
        q.enqueue("a", Duration::ZERO).unwrap();
        q.enqueue("b", Duration::ZERO).unwrap();
        assert_eq!(q.peek(|m| m.copied()), Some("a"));
        assert_eq!(q.len(), 2);
        q.clear();
        assert!(q.is_empty());
    }

    struct Priority;

    impl Placement<u32> for Priority {
        fn enqueue_index(&self, msg: &u32, queue: &VecDeque<u32>) -> usize {
            // Smaller values dequeue first.
            queue.iter().position(|m| m > msg).unwrap_or(queue.len())
        }
    }

    #[test]
    fn test_priority_placement() {
        let q = MessageQueue::with_placement(0, Priority);
        for v in [5u32, 1, 3, 2, 4] {
            q.enqueue(v, Duration::ZERO).unwrap();
        }
        let drained: Vec<u32> = std::iter::from_fn(|| q.dequeue(Duration::ZERO)).collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
    }
}
