//! Extent pool for LARGE blocks
//!
//! Carves exact-fit byte ranges out of one segment. Free extents are kept in a
//! B-tree keyed by start offset: allocation is first-fit in offset order and
//! release coalesces with both neighbours.

use crate::error::{ExtAllocError, Result};
use std::collections::BTreeMap;

/// A contiguous byte range of the backing storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Absolute start offset
    pub start: u64,
    /// Length in bytes
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains an offset
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Check if this extent is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Coalesce two adjacent extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Some(Extent::new(start, end - start))
    }
}

/// Free-extent table for one LARGE segment
#[derive(Debug, Clone)]
pub struct ExtentPool {
    /// Free extents indexed by start offset
    free_extents: BTreeMap<u64, Extent>,

    /// Live extents: start offset -> length
    live: BTreeMap<u64, u64>,

    free_bytes: u64,
}

impl ExtentPool {
    /// Create a pool with the whole range free
    pub fn new(start: u64, length: u64) -> Self {
        let mut free_extents = BTreeMap::new();
        if length > 0 {
            free_extents.insert(start, Extent::new(start, length));
        }

        ExtentPool {
            free_extents,
            live: BTreeMap::new(),
            free_bytes: length,
        }
    }

    /// Carve `length` bytes from the lowest free extent that fits
    pub fn allocate(&mut self, length: u64) -> Option<u64> {
        if length == 0 || length > self.free_bytes {
            return None;
        }

        let extent = self
            .free_extents
            .values()
            .find(|extent| extent.length >= length)
            .copied()?;

        self.free_extents.remove(&extent.start);
        if extent.length > length {
            let rest = Extent::new(extent.start + length, extent.length - length);
            self.free_extents.insert(rest.start, rest);
        }

        self.live.insert(extent.start, length);
        self.free_bytes -= length;

        Some(extent.start)
    }

    /// Return a live extent. `Ok(true)` means the pool is now fully free.
    pub fn release(&mut self, start: u64, length: u64) -> Result<bool> {
        match self.live.get(&start) {
            Some(&live_length) if live_length == length => {}
            Some(_) => {
                return Err(ExtAllocError::SizeMismatch {
                    offset: start,
                    size: length,
                })
            }
            None if self.free_extents.values().any(|e| e.contains(start)) => {
                return Err(ExtAllocError::DoubleFree(start));
            }
            None => return Err(ExtAllocError::InvalidOffset(start)),
        }

        self.live.remove(&start);
        self.insert_and_coalesce(Extent::new(start, length));
        self.free_bytes += length;

        Ok(self.live.is_empty())
    }

    /// Insert a free extent and coalesce with adjacent extents
    fn insert_and_coalesce(&mut self, mut extent: Extent) {
        let prev = self
            .free_extents
            .range(..extent.start)
            .next_back()
            .map(|(_, prev)| *prev);
        if let Some(merged) = prev.and_then(|prev| prev.coalesce(&extent)) {
            self.free_extents.remove(&merged.start);
            extent = merged;
        }

        if let Some(next) = self.free_extents.get(&extent.end()).copied() {
            self.free_extents.remove(&next.start);
            extent = Extent::new(extent.start, extent.length + next.length);
        }

        self.free_extents.insert(extent.start, extent);
    }

    /// Whether `start` begins a live extent
    pub fn is_allocated(&self, start: u64) -> bool {
        self.live.contains_key(&start)
    }

    pub fn largest_free(&self) -> u64 {
        self.free_extents
            .values()
            .map(|extent| extent.length)
            .max()
            .unwrap_or(0)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Current number of free extents (fragmentation indicator)
    pub fn extent_count(&self) -> usize {
        self.free_extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_extent_contains() {
        let extent = Extent::new(10, 20);
        assert!(!extent.contains(9));
        assert!(extent.contains(10));
        assert!(extent.contains(29));
        assert!(!extent.contains(30));
    }

    #[test]
    fn test_extent_adjacency() {
        let e1 = Extent::new(10, 10); // 10-19
        let e2 = Extent::new(20, 10); // 20-29
        let e3 = Extent::new(30, 10); // 30-39

        assert!(e1.is_adjacent(&e2));
        assert!(e2.is_adjacent(&e1));
        assert!(!e1.is_adjacent(&e3));
        assert_eq!(e1.coalesce(&e2), Some(Extent::new(10, 20)));
        assert_eq!(e1.coalesce(&e3), None);
    }

    #[test]
    fn test_pool_creation() {
        let pool = ExtentPool::new(256 * MB, 256 * MB);
        assert_eq!(pool.free_bytes(), 256 * MB);
        assert_eq!(pool.largest_free(), 256 * MB);
        assert_eq!(pool.extent_count(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_first_fit_in_offset_order() {
        let mut pool = ExtentPool::new(0, 100 * MB);

        let a = pool.allocate(10 * MB).unwrap();
        let b = pool.allocate(20 * MB).unwrap();
        let c = pool.allocate(10 * MB).unwrap();
        assert_eq!((a, b, c), (0, 10 * MB, 30 * MB));

        // gap of 20MB at 10MB, 60MB tail at 40MB
        pool.release(b, 20 * MB).unwrap();
        assert_eq!(pool.allocate(5 * MB), Some(10 * MB));
        assert_eq!(pool.allocate(30 * MB), Some(40 * MB));
    }

    #[test]
    fn test_release_coalesces() {
        let mut pool = ExtentPool::new(0, 100 * MB);

        let a = pool.allocate(10 * MB).unwrap();
        let b = pool.allocate(10 * MB).unwrap();
        let c = pool.allocate(10 * MB).unwrap();
        assert_eq!(pool.extent_count(), 1);

        assert!(!pool.release(b, 10 * MB).unwrap());
        assert_eq!(pool.extent_count(), 2);

        assert!(!pool.release(a, 10 * MB).unwrap());
        assert_eq!(pool.extent_count(), 2); // 0-20MB and 30-100MB

        assert!(pool.release(c, 10 * MB).unwrap());
        assert_eq!(pool.extent_count(), 1);
        assert_eq!(pool.largest_free(), 100 * MB);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = ExtentPool::new(0, 10 * MB);
        assert_eq!(pool.allocate(10 * MB), Some(0));
        assert_eq!(pool.allocate(MB), None);
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn test_fragmented_pool_refuses_large_request() {
        let mut pool = ExtentPool::new(0, 30 * MB);
        let a = pool.allocate(10 * MB).unwrap();
        pool.allocate(10 * MB).unwrap();
        pool.release(a, 10 * MB).unwrap();
        pool.allocate(5 * MB).unwrap();

        // 15MB free but split 5MB + 10MB
        assert_eq!(pool.free_bytes(), 15 * MB);
        assert_eq!(pool.allocate(12 * MB), None);
    }

    #[test]
    fn test_release_validation() {
        let mut pool = ExtentPool::new(0, 100 * MB);
        let a = pool.allocate(10 * MB).unwrap();

        assert!(matches!(
            pool.release(a, 20 * MB),
            Err(ExtAllocError::SizeMismatch { .. })
        ));
        assert!(matches!(
            pool.release(50 * MB, 10 * MB),
            Err(ExtAllocError::DoubleFree(_))
        ));
        assert!(matches!(
            pool.release(a + MB, 10 * MB),
            Err(ExtAllocError::InvalidOffset(_))
        ));

        pool.release(a, 10 * MB).unwrap();
        assert!(!pool.is_allocated(a));
    }
}
