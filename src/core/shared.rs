//! Thread-safe handle to an allocator
//!
//! `ExternalAllocator` is single-threaded. When several threads need it,
//! share one through this handle; every call takes the lock for its whole
//! duration, which is short since nothing blocks on I/O.

use crate::allocator::{AllocationStats, ExternalAllocator};
use crate::error::{ExtAllocError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SharedAllocator {
    inner: Arc<Mutex<ExternalAllocator>>,
}

impl SharedAllocator {
    pub fn new(allocator: ExternalAllocator) -> Self {
        SharedAllocator {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    pub fn allocate(&self, size: u64) -> Result<u64> {
        self.inner.lock().allocate(size)
    }

    pub fn release(&self, offset: u64, size: u64) -> Result<()> {
        self.inner.lock().release(offset, size)
    }

    pub fn grow_by(&self, offset: u64, size: u64) -> Result<()> {
        self.inner.lock().grow_by(offset, size)
    }

    /// Allocate, growing under the lock so no other thread observes the
    /// medium and the allocator out of step
    pub fn allocate_or_grow<F, E>(&self, size: u64, grow: F) -> std::result::Result<u64, E>
    where
        F: FnMut(u64, u64) -> std::result::Result<(), E>,
        E: From<ExtAllocError>,
    {
        self.inner.lock().allocate_or_grow(size, grow)
    }

    pub fn capacity(&self) -> u64 {
        self.inner.lock().capacity()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.inner.lock().allocated_bytes()
    }

    pub fn is_allocated(&self, offset: u64) -> bool {
        self.inner.lock().is_allocated(offset)
    }

    pub fn stats(&self) -> AllocationStats {
        self.inner.lock().stats()
    }

    /// Run several operations under one lock acquisition
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut ExternalAllocator) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl From<ExternalAllocator> for SharedAllocator {
    fn from(allocator: ExternalAllocator) -> Self {
        Self::new(allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{good_size, SEGMENT_SIZE};
    use std::thread;

    #[test]
    fn test_clones_share_state() {
        let shared = SharedAllocator::new(ExternalAllocator::new());
        let other = shared.clone();

        other.grow_by(0, SEGMENT_SIZE).unwrap();
        let offset = shared.allocate(4096).unwrap();
        assert!(other.is_allocated(offset));
        assert_eq!(other.allocated_bytes(), 4096);
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let shared = SharedAllocator::new(ExternalAllocator::new());
        let size = 20 * 1024;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            shared
                                .allocate_or_grow(size, |_, _| Ok::<(), ExtAllocError>(()))
                                .unwrap()
                        })
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut offsets: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        offsets.sort_unstable();
        offsets.dedup();

        assert_eq!(offsets.len(), 400);
        assert_eq!(shared.allocated_bytes(), 400 * good_size(size));
        assert_eq!(shared.capacity(), SEGMENT_SIZE);
    }

    #[test]
    fn test_with_lock_batches_operations() {
        let shared = SharedAllocator::from(ExternalAllocator::new());
        let offset = shared.with_lock(|alloc| {
            alloc.grow_by(0, SEGMENT_SIZE)?;
            alloc.allocate(8192)
        });

        let offset = offset.unwrap();
        assert_eq!(shared.stats().allocated_bytes, 8192);
        shared.release(offset, 8192).unwrap();
        assert_eq!(shared.allocated_bytes(), 0);
    }
}
