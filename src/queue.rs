//! Lock-guarded double-ended queue shared between the network thread and the
//! simulation thread.
//!
//! Each operation holds the lock only for its own duration. Sequences such as
//! "check `is_empty`, then `pop_front`" are not atomic; use the `Option`
//! returned by the pop instead.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Thread-safe FIFO/LIFO sequence
#[derive(Debug)]
pub struct ConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn push_back(&self, item: T) {
        self.items.lock().push_back(item);
    }

    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
    }

    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Pop up to `max` items from the front under a single lock
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let count = max.min(items.len());
        items.drain(..count).collect()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl<T: Clone> ConcurrentQueue<T> {
    /// Copy of the front item
    pub fn front(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }

    /// Copy of the back item
    pub fn back(&self) -> Option<T> {
        self.items.lock().back().cloned()
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = ConcurrentQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.push_back(3);

        assert_eq!(queue.front(), Some(1));
        assert_eq!(queue.back(), Some(3));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.pop_front(), Some(3));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn test_both_ends() {
        let queue = ConcurrentQueue::new();
        queue.push_back("b");
        queue.push_front("a");
        queue.push_back("c");

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_back(), Some("c"));
        assert_eq!(queue.pop_front(), Some("a"));
        assert_eq!(queue.pop_back(), Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_is_bounded() {
        let queue = ConcurrentQueue::new();
        for i in 0..5 {
            queue.push_back(i);
        }

        assert_eq!(queue.drain(3), vec![0, 1, 2]);
        assert_eq!(queue.drain(10), vec![3, 4]);
        assert!(queue.drain(1).is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = ConcurrentQueue::new();
        queue.push_back(1);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn test_concurrent_pushes_preserve_count() {
        const PER_THREAD: u32 = 10_000;
        let queue = Arc::new(ConcurrentQueue::new());

        let producers: Vec<_> = (0..2u32)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        queue.push_back(producer * PER_THREAD + i);
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = HashSet::new();
        let mut last_per_producer = [None::<u32>; 2];
        while let Some(item) = queue.pop_front() {
            assert!(seen.insert(item), "duplicate item {}", item);

            // FIFO holds per producer
            let producer = (item / PER_THREAD) as usize;
            if let Some(last) = last_per_producer[producer] {
                assert!(item > last);
            }
            last_per_producer[producer] = Some(item);
        }

        assert_eq!(seen.len(), 2 * PER_THREAD as usize);
    }
}
