//! Lock-free single-producer/single-consumer ring of opaque pointers.
//!
//! Capacity is fixed at compile time at [`RING_CAPACITY`] (a power of two),
//! matching the fixed-size rings used throughout the engine: one pair backs
//! the adaptive pool's work queue, one pair backs the TUN writer queue.
//!
//! The producer and consumer each get their own handle so that the
//! single-writer/single-reader discipline is enforced by the type system
//! instead of by convention (see the design note on SPSC discipline).

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const RING_CAPACITY: usize = 4096;
const MASK: usize = RING_CAPACITY - 1;

struct Slots<T>(UnsafeCell<[Option<NonNull<T>>; RING_CAPACITY]>);

// Safety: access to `Slots` is only ever through the producer writing
// `head` and the consumer writing `tail`; the two never touch the same
// index concurrently because `push`/`pop` only advance past a slot after
// publishing the corresponding atomic index.
unsafe impl<T> Sync for Slots<T> {}

const CACHE_LINE: usize = 64;

/// Pads its contents out to a full cache line so two adjacent instances
/// never share one, avoiding false-sharing ping-pong between the producer
/// and the consumer.
#[repr(align(64))]
struct CachePadded<T>(T);

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

struct Shared<T> {
    /// Producer-owned head index, padded onto its own cache line so stores
    /// to it never invalidate the cache line `tail` lives on.
    head: CachePadded<AtomicUsize>,
    /// Consumer-owned tail index, on its own cache line for the same reason.
    tail: CachePadded<AtomicUsize>,
    slots: Slots<T>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Shared {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            slots: Slots(UnsafeCell::new([None; RING_CAPACITY])),
        }
    }
}

/// Construct a fresh ring, returning its producer and consumer halves.
pub fn channel<T>() -> (SpscProducer<T>, SpscConsumer<T>) {
    let shared = Arc::new(Shared::new());
    (
        SpscProducer {
            shared: shared.clone(),
            cached_tail: 0,
        },
        SpscConsumer {
            shared,
            cached_head: 0,
        },
    )
}

/// The producer-only half. `push` must only be called from one thread.
pub struct SpscProducer<T> {
    shared: Arc<Shared<T>>,
    /// Locally cached view of the consumer's tail, refreshed on demand.
    cached_tail: usize,
}

/// The consumer-only half. `pop` must only be called from one thread.
pub struct SpscConsumer<T> {
    shared: Arc<Shared<T>>,
    /// Locally cached view of the producer's head, refreshed on demand.
    cached_head: usize,
}

// Safety: `SpscProducer`/`SpscConsumer` each hold the only handle that is
// permitted to write their respective atomic index; sending the handle to
// another thread is fine as long as the single-producer/single-consumer
// discipline (one live handle of each kind at a time) is upheld by the
// caller, which is exactly what splitting the type enforces.
unsafe impl<T> Send for SpscProducer<T> {}
unsafe impl<T> Send for SpscConsumer<T> {}

impl<T> SpscProducer<T> {
    /// Attempt to push a pointer. Returns `Err(ptr)` if the ring is full.
    pub fn push(&mut self, ptr: NonNull<T>) -> Result<(), NonNull<T>> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let next = (head + 1) & MASK;

        if next == self.cached_tail {
            self.cached_tail = self.shared.tail.load(Ordering::Acquire);
            if next == self.cached_tail {
                return Err(ptr);
            }
        }

        // Safety: only the producer writes slot `head`, and the consumer
        // has not yet observed this `head` value (the release store below
        // has not happened), so there is no concurrent access to the slot.
        unsafe {
            (*self.shared.slots.0.get())[head] = Some(ptr);
        }
        self.shared.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Approximate occupied length, racy with a concurrent consumer.
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & MASK
    }

    pub fn is_full(&mut self) -> bool {
        let head = self.shared.head.load(Ordering::Relaxed);
        let next = (head + 1) & MASK;
        if next == self.cached_tail {
            self.cached_tail = self.shared.tail.load(Ordering::Acquire);
        }
        next == self.cached_tail
    }
}

impl<T> SpscConsumer<T> {
    /// Attempt to pop a pointer. Returns `None` if the ring is empty.
    pub fn pop(&mut self) -> Option<NonNull<T>> {
        let tail = self.shared.tail.load(Ordering::Relaxed);

        if tail == self.cached_head {
            self.cached_head = self.shared.head.load(Ordering::Acquire);
            if tail == self.cached_head {
                return None;
            }
        }

        // Safety: only the consumer writes slot `tail`, and the producer
        // will not reuse this slot until it sees the release store below.
        let value = unsafe { (*self.shared.slots.0.get())[tail].take() };
        let next = (tail + 1) & MASK;
        self.shared.tail.store(next, Ordering::Release);
        value
    }

    pub fn is_empty(&self) -> bool {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        head == tail
    }

    /// Approximate occupied length, racy with a concurrent producer.
    pub fn len(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        head.wrapping_sub(tail) & MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_pops_none() {
        let (_p, mut c) = channel::<u8>();
        assert!(c.pop().is_none());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (mut p, mut c) = channel::<u32>();
        let mut values = [10u32, 20, 30];
        for v in values.iter_mut() {
            p.push(NonNull::from(v)).unwrap();
        }
        for expect in [10u32, 20, 30] {
            let got = unsafe { *c.pop().unwrap().as_ref() };
            assert_eq!(got, expect);
        }
        assert!(c.pop().is_none());
    }

    #[test]
    fn ring_rejects_push_when_full() {
        let (mut p, mut c) = channel::<u32>();
        let mut storage = vec![0u32; RING_CAPACITY];
        let mut accepted = 0;
        for v in storage.iter_mut() {
            if p.push(NonNull::from(v)).is_ok() {
                accepted += 1;
            }
        }
        // one slot is always sacrificed to disambiguate full vs empty
        assert_eq!(accepted, RING_CAPACITY - 1);
        assert!(p.push(NonNull::from(&mut storage[0])).is_err());

        c.pop().unwrap();
        assert!(p.push(NonNull::from(&mut storage[0])).is_ok());
    }
}
