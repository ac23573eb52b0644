//! Bounded lock-free free-lists.
//!
//! MPMC queue plus an atomic length counter, so pool operations stay off
//! the mutex path. `offer` refuses when a cap would be exceeded or when
//! the endpoint is not running — during shutdown returned objects are
//! simply dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::buffer::BufferPair;

/// Shared gate flipped by the endpoint lifecycle. Pools only accept
/// returns while the gate is open.
#[derive(Debug, Default)]
pub struct RunningGate {
    open: AtomicBool,
}

impl RunningGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, running: bool) {
        self.open.store(running, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// A bounded MPMC free-list.
pub struct FreeList<T> {
    queue: SegQueue<T>,
    len: AtomicUsize,
    /// Maximum pooled objects; negative = unbounded.
    max: i64,
    gate: Arc<RunningGate>,
}

impl<T> FreeList<T> {
    pub fn new(max: i64, gate: Arc<RunningGate>) -> Self {
        Self {
            queue: SegQueue::new(),
            len: AtomicUsize::new(0),
            max,
            gate,
        }
    }

    /// Return an object to the pool. `false` means the object was refused
    /// (cap reached or endpoint not running) and should be dropped.
    pub fn offer(&self, item: T) -> bool {
        if !self.gate.is_open() {
            return false;
        }
        if self.max >= 0 {
            // Optimistically claim a slot; undo on overshoot. Sizing is
            // approximate under contention, which is all the cap needs.
            let claimed = self.len.fetch_add(1, Ordering::AcqRel) + 1;
            if claimed as i64 > self.max {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            self.queue.push(item);
            true
        } else {
            self.len.fetch_add(1, Ordering::AcqRel);
            self.queue.push(item);
            true
        }
    }

    /// Take an object from the pool, if any.
    pub fn poll(&self) -> Option<T> {
        let item = self.queue.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Approximate pooled count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything currently pooled.
    pub fn clear(&self) {
        while self.poll().is_some() {}
    }
}

/// Buffer-pair pool with an additional total-bytes cap.
pub struct BufferPool {
    list: FreeList<BufferPair>,
    bytes: AtomicUsize,
    /// Maximum total capacity held; negative = unbounded.
    max_bytes: i64,
}

impl BufferPool {
    pub fn new(max_pairs: i64, max_bytes: i64, gate: Arc<RunningGate>) -> Self {
        Self {
            list: FreeList::new(max_pairs, gate),
            bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    pub fn offer(&self, mut pair: BufferPair) -> bool {
        pair.reset();
        let cap = pair.capacity();
        if self.max_bytes >= 0 {
            let claimed = self.bytes.fetch_add(cap, Ordering::AcqRel) + cap;
            if claimed as i64 > self.max_bytes {
                self.bytes.fetch_sub(cap, Ordering::AcqRel);
                return false;
            }
        } else {
            self.bytes.fetch_add(cap, Ordering::AcqRel);
        }
        if self.list.offer(pair) {
            true
        } else {
            self.bytes.fetch_sub(cap, Ordering::AcqRel);
            false
        }
    }

    pub fn poll(&self) -> Option<BufferPair> {
        let pair = self.list.poll()?;
        self.bytes.fetch_sub(pair.capacity(), Ordering::AcqRel);
        Some(pair)
    }

    /// Total buffer capacity currently pooled.
    pub fn pooled_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        while self.poll().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_gate() -> Arc<RunningGate> {
        let gate = RunningGate::new();
        gate.set(true);
        gate
    }

    #[test]
    fn offer_then_poll_round_trips() {
        let pool: FreeList<u32> = FreeList::new(8, open_gate());
        assert!(pool.offer(42));
        assert_eq!(pool.poll(), Some(42));
        assert_eq!(pool.poll(), None);
    }

    #[test]
    fn offer_refused_when_not_running() {
        let gate = RunningGate::new();
        let pool: FreeList<u32> = FreeList::new(8, gate.clone());
        assert!(!pool.offer(1));
        gate.set(true);
        assert!(pool.offer(1));
        gate.set(false);
        assert!(!pool.offer(2));
        // Draining still works during shutdown.
        assert_eq!(pool.poll(), Some(1));
    }

    #[test]
    fn offer_refused_over_cap() {
        let pool: FreeList<u32> = FreeList::new(2, open_gate());
        assert!(pool.offer(1));
        assert!(pool.offer(2));
        assert!(!pool.offer(3));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn unbounded_pool_accepts_everything() {
        let pool: FreeList<u32> = FreeList::new(-1, open_gate());
        for i in 0..10_000 {
            assert!(pool.offer(i));
        }
        assert_eq!(pool.len(), 10_000);
    }

    #[test]
    fn buffer_pool_enforces_byte_cap() {
        let pool = BufferPool::new(-1, 10 * 1024, open_gate());
        assert!(pool.offer(BufferPair::new(4096, 4096).unwrap()));
        // Second pair would exceed the byte cap.
        assert!(!pool.offer(BufferPair::new(4096, 4096).unwrap()));
        let taken = pool.poll().unwrap();
        assert!(taken.capacity() >= 8192);
        assert_eq!(pool.pooled_bytes(), 0);
    }

    #[test]
    fn buffer_pool_resets_returned_pairs() {
        let pool = BufferPool::new(4, -1, open_gate());
        let mut pair = BufferPair::new(64, 64).unwrap();
        pair.read().extend_from_slice(b"stale");
        assert!(pool.offer(pair));
        let mut pair = pool.poll().unwrap();
        assert!(pair.read().is_empty());
    }

    #[test]
    fn clear_empties_the_pool() {
        let pool: FreeList<u32> = FreeList::new(-1, open_gate());
        for i in 0..16 {
            pool.offer(i);
        }
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.poll(), None);
    }
}
