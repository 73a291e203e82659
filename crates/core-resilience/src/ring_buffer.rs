//! Concurrent evicting ring buffer
//!
//! A fixed-capacity FIFO that overwrites its oldest element once full. It is
//! the storage underneath both the count-based sliding window and the event
//! replay log: both need "keep the last N, cheap insert, occasionally read
//! from other threads".
//!
//! Writers always take the exclusive lock. Readers first make a bounded number
//! of optimistic attempts that never park the thread (`try_read`), then fall
//! back to a blocking shared lock. A modification counter lets iterators
//! detect structural change between steps and report
//! [`ResilienceError::ConcurrentModification`] instead of mixing two
//! generations of content.
//!
//! # Example
//!
//! ```
//! use bulwark_core_resilience::ring_buffer::ConcurrentRingBuffer;
//!
//! let ring = ConcurrentRingBuffer::new(2).unwrap();
//! ring.insert(1);
//! ring.insert(2);
//! assert_eq!(ring.insert(3), Some(1)); // oldest evicted
//! assert_eq!(ring.snapshot(), vec![2, 3]);
//! ```

use crate::error::ResilienceError;
use parking_lot::{RwLock, RwLockReadGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Optimistic read attempts before blocking on the shared lock
const OPTIMISTIC_RETRIES: usize = 5;

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    size: usize,
}

impl<T> Ring<T> {
    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }
}

/// Fixed-capacity FIFO with overwrite-on-full semantics
pub struct ConcurrentRingBuffer<T> {
    capacity: usize,
    ring: RwLock<Ring<T>>,
    len: AtomicUsize,
    modifications: AtomicU64,
}

impl<T> ConcurrentRingBuffer<T> {
    /// Create an empty buffer. A zero capacity is a configuration error.
    pub fn new(capacity: usize) -> Result<Self, ResilienceError> {
        if capacity == 0 {
            return Err(ResilienceError::InvalidConfig(
                "ring buffer capacity must be greater than 0".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            capacity,
            ring: RwLock::new(Ring {
                slots,
                head: 0,
                tail: 0,
                size: 0,
            }),
            len: AtomicUsize::new(0),
            modifications: AtomicU64::new(0),
        })
    }

    /// Maximum number of elements held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of elements
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Check if the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the next insert will evict
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Number of structural modifications so far
    pub fn modification_count(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    /// Append at the tail. When full, the head is evicted first and returned.
    pub fn insert(&self, value: T) -> Option<T> {
        self.write(|ring| {
            if ring.size == 0 {
                let tail = ring.tail;
                ring.slots[tail] = Some(value);
                ring.size = 1;
                None
            } else if ring.size == ring.slots.len() {
                ring.head = ring.next_index(ring.head);
                ring.tail = ring.next_index(ring.tail);
                let tail = ring.tail;
                ring.slots[tail].replace(value)
            } else {
                ring.tail = ring.next_index(ring.tail);
                let tail = ring.tail;
                ring.slots[tail] = Some(value);
                ring.size += 1;
                None
            }
        })
    }

    /// Remove and return the oldest element
    pub fn poll(&self) -> Option<T> {
        self.write(|ring| {
            if ring.size == 0 {
                return None;
            }
            let head = ring.head;
            let value = ring.slots[head].take();
            if ring.size != 1 {
                ring.head = ring.next_index(head);
            }
            ring.size -= 1;
            value
        })
    }

    /// Remove every element
    pub fn clear(&self) {
        self.write(|ring| {
            for slot in ring.slots.iter_mut() {
                *slot = None;
            }
            ring.head = 0;
            ring.tail = 0;
            ring.size = 0;
        })
    }

    fn write<R>(&self, op: impl FnOnce(&mut Ring<T>) -> R) -> R {
        let mut ring = self.ring.write();
        let result = op(&mut ring);
        self.len.store(ring.size, Ordering::Release);
        self.modifications.fetch_add(1, Ordering::AcqRel);
        result
    }

    fn read<R>(&self, op: impl Fn(&Ring<T>) -> R) -> R {
        for _ in 0..OPTIMISTIC_RETRIES {
            if let Some(ring) = self.ring.try_read() {
                return op(&ring);
            }
            std::hint::spin_loop();
        }
        let ring: RwLockReadGuard<'_, Ring<T>> = self.ring.read();
        op(&ring)
    }
}

impl<T: Clone> ConcurrentRingBuffer<T> {
    /// Oldest element without removing it
    pub fn peek(&self) -> Option<T> {
        self.read(|ring| {
            if ring.size == 0 {
                None
            } else {
                ring.slots[ring.head].clone()
            }
        })
    }

    /// Consistent copy of the contents, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.read(|ring| {
            let mut out = Vec::with_capacity(ring.size);
            let mut cursor = ring.head;
            for _ in 0..ring.size {
                if let Some(value) = &ring.slots[cursor] {
                    out.push(value.clone());
                }
                cursor = ring.next_index(cursor);
            }
            out
        })
    }

    /// Step-wise iterator, oldest first.
    ///
    /// Each step re-validates the modification counter captured at creation;
    /// after a concurrent insert/poll/clear the iterator yields a single
    /// `Err(ConcurrentModification)` and then ends.
    pub fn iter(&self) -> Iter<'_, T> {
        let (cursor, expected) = self.read(|ring| (ring.head, self.modification_count()));
        Iter {
            buffer: self,
            cursor,
            visited: 0,
            expected_modifications: expected,
            failed: false,
        }
    }
}

impl<T> fmt::Debug for ConcurrentRingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentRingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("modifications", &self.modification_count())
            .finish()
    }
}

/// Iterator returned by [`ConcurrentRingBuffer::iter`]
pub struct Iter<'a, T> {
    buffer: &'a ConcurrentRingBuffer<T>,
    cursor: usize,
    visited: usize,
    expected_modifications: u64,
    failed: bool,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = Result<T, ResilienceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let buffer = self.buffer;
        let step = buffer.read(|ring| {
            if buffer.modification_count() != self.expected_modifications {
                return Some(Err(ResilienceError::ConcurrentModification));
            }
            if self.visited >= ring.size {
                return None;
            }
            let item = ring.slots[self.cursor].clone();
            Some(item.ok_or(ResilienceError::ConcurrentModification))
        });
        match step {
            Some(Ok(item)) => {
                self.cursor = if self.cursor + 1 == buffer.capacity {
                    0
                } else {
                    self.cursor + 1
                };
                self.visited += 1;
                Some(Ok(item))
            }
            Some(Err(err)) => {
                self.failed = true;
                Some(Err(err))
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_capacity_rejected() {
        let result = ConcurrentRingBuffer::<u32>::new(0);
        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));
    }

    #[test]
    fn test_insert_until_full_then_evict() {
        let ring = ConcurrentRingBuffer::new(3).unwrap();
        assert_eq!(ring.insert('a'), None);
        assert_eq!(ring.insert('b'), None);
        assert_eq!(ring.insert('c'), None);
        assert!(ring.is_full());

        assert_eq!(ring.insert('d'), Some('a'), "oldest must be evicted");
        assert_eq!(ring.insert('e'), Some('b'));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec!['c', 'd', 'e']);
        assert_eq!(ring.peek(), Some('c'));
    }

    #[test]
    fn test_poll_and_clear() {
        let ring = ConcurrentRingBuffer::new(2).unwrap();
        ring.insert(1);
        ring.insert(2);
        ring.insert(3);

        assert_eq!(ring.poll(), Some(2));
        assert_eq!(ring.poll(), Some(3));
        assert_eq!(ring.poll(), None);
        assert!(ring.is_empty());

        ring.insert(7);
        assert_eq!(ring.snapshot(), vec![7]);

        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.peek(), None);
    }

    #[test]
    fn test_capacity_one() {
        let ring = ConcurrentRingBuffer::new(1).unwrap();
        assert_eq!(ring.insert(1), None);
        assert_eq!(ring.insert(2), Some(1));
        assert_eq!(ring.insert(3), Some(2));
        assert_eq!(ring.snapshot(), vec![3]);
    }

    #[test]
    fn test_iterator_reports_concurrent_modification() {
        let ring = ConcurrentRingBuffer::new(4).unwrap();
        ring.insert(1);
        ring.insert(2);
        ring.insert(3);

        let mut iter = ring.iter();
        assert_eq!(iter.next(), Some(Ok(1)));
        ring.insert(4);
        assert_eq!(iter.next(), Some(Err(ResilienceError::ConcurrentModification)));
        assert_eq!(iter.next(), None, "iterator must stop after the failure");
    }

    #[test]
    fn test_iterator_walks_wrapped_contents() {
        let ring = ConcurrentRingBuffer::new(3).unwrap();
        for i in 0..5 {
            ring.insert(i);
        }
        let items: Result<Vec<_>, _> = ring.iter().collect();
        assert_eq!(items.unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_modification_count_increases_per_write() {
        let ring = ConcurrentRingBuffer::new(2).unwrap();
        let before = ring.modification_count();
        ring.insert(1);
        ring.insert(2);
        ring.poll();
        assert_eq!(ring.modification_count(), before + 3);
    }

    #[test]
    fn test_concurrent_inserts_keep_size_bounded() {
        let ring = Arc::new(ConcurrentRingBuffer::new(16).unwrap());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let r = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000u64 {
                    r.insert(t * 10_000 + i);
                    let snap = r.snapshot();
                    assert!(snap.len() <= 16);
                }
            }));
        }
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(ring.len(), 16);
        assert_eq!(ring.snapshot().len(), 16);
    }
}
