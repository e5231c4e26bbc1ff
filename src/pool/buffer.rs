//! Fixed-capacity, cache-line-aligned buffer pool claimed by an atomic
//! bitmap, matching `hev_memory_pool`'s allocation scheme.
//!
//! Every packet buffer the engine hands between threads is backed by a slot
//! in one of these pools. `allocate`/`free` are wait-free on the fast path:
//! `allocate` does a `find-first-set` scan over bitmap words with a CAS
//! retry loop, `free` does a single `fetch_or`.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Size of one pool buffer. Matches `POOL_BUFFER_SIZE` upstream and the 2 KiB
/// ceiling on a single IP datagram's worth of TUN payload.
pub const BUFFER_SIZE: usize = 2048;
/// Hard ceiling on pool capacity (`POOL_MAX_BUFFERS` upstream).
pub const MAX_BUFFERS: usize = 2048;
const CACHE_LINE: usize = 64;
const WORD_BITS: usize = 32;

/// A single pool-owned, cache-line-aligned byte region.
pub struct Buffer {
    ptr: NonNull<u8>,
}

impl Buffer {
    fn layout() -> Layout {
        Layout::from_size_align(BUFFER_SIZE, CACHE_LINE).expect("valid buffer layout")
    }

    fn alloc_aligned() -> NonNull<u8> {
        // Safety: `layout` has non-zero size and a valid alignment.
        let raw = unsafe { alloc(Self::layout()) };
        NonNull::new(raw).expect("out of memory allocating pool buffer")
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: `ptr` points at a live `BUFFER_SIZE` allocation for the
        // lifetime of this `Buffer`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), BUFFER_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: see `as_slice`; exclusive access is guaranteed by `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), BUFFER_SIZE) }
    }
}

/// Fixed-capacity pool of pre-allocated [`Buffer`]s, claimed via an atomic
/// free bitmap. Capacity is clamped to [`MAX_BUFFERS`].
pub struct BufferPool {
    buffers: Vec<Buffer>,
    /// `free_bitmap[i]` bit `b` set means slot `i*32+b` is free.
    free_bitmap: Vec<AtomicU32>,
    capacity: usize,
    allocated: AtomicUsize,
    peak: AtomicUsize,
}

// Safety: `Buffer` is a raw owning pointer to a heap allocation with no
// aliasing beyond what the bitmap protocol already prevents: a bit is only
// ever cleared (claimed) by one winning CAS, so `&Buffer` access handed out
// by `allocate` never overlaps with another live handle for the same slot.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_BUFFERS);
        let buffers = (0..capacity)
            .map(|_| Buffer {
                ptr: Buffer::alloc_aligned(),
            })
            .collect();

        let word_count = (capacity + WORD_BITS - 1) / WORD_BITS;
        let free_bitmap = (0..word_count)
            .map(|i| {
                let mask = if i == word_count - 1 {
                    let remaining = capacity - i * WORD_BITS;
                    if remaining >= WORD_BITS {
                        u32::MAX
                    } else {
                        (1u32 << remaining) - 1
                    }
                } else {
                    u32::MAX
                };
                AtomicU32::new(mask)
            })
            .collect();

        BufferPool {
            buffers,
            free_bitmap,
            capacity,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a free slot, returning its buffer pointer, or `None` if every
    /// slot is currently claimed.
    pub fn allocate(&self) -> Option<*mut u8> {
        for (word_idx, word) in self.free_bitmap.iter().enumerate() {
            let mut bitmap = word.load(Ordering::Acquire);
            while bitmap != 0 {
                let bit = bitmap.trailing_zeros();
                let mask = 1u32 << bit;
                let desired = bitmap & !mask;

                match word.compare_exchange_weak(
                    bitmap,
                    desired,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let index = word_idx * WORD_BITS + bit as usize;
                        self.bump_stats();
                        return Some(self.buffers[index].as_ptr());
                    }
                    Err(seen) => bitmap = seen,
                }
            }
        }
        None
    }

    fn bump_stats(&self) {
        let allocated = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while allocated > peak {
            match self.peak.compare_exchange_weak(
                peak,
                allocated,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => peak = seen,
            }
        }
    }

    /// Return a buffer to the pool. A double-free or a pointer that does not
    /// belong to this pool is a silent no-op, matching the upstream pool.
    pub fn free(&self, ptr: *mut u8) {
        let Some(index) = self.buffers.iter().position(|b| b.as_ptr() == ptr) else {
            return;
        };

        let word_idx = index / WORD_BITS;
        let bit = index % WORD_BITS;
        let mask = 1u32 << bit;

        let previous = self.free_bitmap[word_idx].fetch_or(mask, Ordering::Release);
        if previous & mask != 0 {
            // Already free: double-free, no-op (do not double-decrement).
            return;
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for buffer in &self.buffers {
            // Safety: every buffer was allocated with the same layout in
            // `new` and is dropped exactly once, here.
            unsafe { dealloc(buffer.as_ptr(), Buffer::layout()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_after_exhaustion() {
        let pool = BufferPool::new(4);
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(pool.allocate());
        }
        let non_null = got.iter().filter(|p| p.is_some()).count();
        assert_eq!(non_null, 4);
        assert!(got[4].is_none());
        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.peak(), 4);
    }

    #[test]
    fn allocate_free_pair_restores_state() {
        let pool = BufferPool::new(8);
        let before: Vec<u32> = pool.free_bitmap.iter().map(|w| w.load(Ordering::SeqCst)).collect();

        let ptr = pool.allocate().unwrap();
        pool.free(ptr);

        let after: Vec<u32> = pool.free_bitmap.iter().map(|w| w.load(Ordering::SeqCst)).collect();
        assert_eq!(before, after);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn double_free_is_noop() {
        let pool = BufferPool::new(4);
        let ptr = pool.allocate().unwrap();
        pool.free(ptr);
        pool.free(ptr);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn foreign_pointer_free_is_noop() {
        let pool = BufferPool::new(4);
        let mut stray = [0u8; 4];
        pool.free(stray.as_mut_ptr());
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn capacity_is_clamped() {
        let pool = BufferPool::new(MAX_BUFFERS + 100);
        assert_eq!(pool.capacity(), MAX_BUFFERS);
    }
}
