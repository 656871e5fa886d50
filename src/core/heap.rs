//! Shared heap page allocator.
//!
//! A fixed pool of 64 KiB page indices shared by every resource bound to the
//! same heap. Allocation is O(1) off a free stack; `num_free` is served from a
//! relaxed atomic so the feedback thread can clamp load batches without taking
//! the lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Sentinel for "no heap page"
pub const INVALID_HEAP_INDEX: u32 = u32::MAX;

/// Pool of heap page indices 0..capacity
#[derive(Debug)]
pub struct HeapAllocator {
    free: Mutex<Vec<u32>>,
    free_count: AtomicUsize,
    capacity: usize,
}

impl HeapAllocator {
    pub fn new(capacity: usize) -> Self {
        assert!((capacity as u64) < INVALID_HEAP_INDEX as u64);
        // reversed so the first allocation hands out index 0
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            free: Mutex::new(free),
            free_count: AtomicUsize::new(capacity),
            capacity,
        }
    }

    /// Returns a free page index, or `INVALID_HEAP_INDEX` when exhausted
    pub fn allocate(&self) -> u32 {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(index) => {
                self.free_count.store(free.len(), Ordering::Relaxed);
                index
            }
            None => INVALID_HEAP_INDEX,
        }
    }

    /// Return a page to the pool
    pub fn free(&self, index: u32) {
        debug_assert!((index as usize) < self.capacity);
        let mut free = self.free.lock().unwrap();
        debug_assert!(!free.contains(&index), "double free of heap page {}", index);
        free.push(index);
        self.free_count.store(free.len(), Ordering::Relaxed);
    }

    /// Bulk return, e.g. when destroying a resource
    pub fn free_many(&self, indices: &[u32]) {
        let mut free = self.free.lock().unwrap();
        for &index in indices {
            debug_assert!((index as usize) < self.capacity);
            free.push(index);
        }
        self.free_count.store(free.len(), Ordering::Relaxed);
    }

    /// Approximate count of free pages. Exact only when no other thread is
    /// allocating; callers treat it as a batch clamp, not a reservation.
    pub fn num_free(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
