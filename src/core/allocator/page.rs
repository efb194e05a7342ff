//! Pages of equal-size blocks
//!
//! A page belongs to one segment and serves one bin until it empties. Blocks
//! are handed out lazily: indices below `reserved` have been used at least
//! once, released ones sit on a LIFO free list so recently freed blocks are
//! reused first. Nothing is stored per block except one occupancy bit.

use super::{SegmentId, BLOCK_ALIGNMENT, SMALL_PAGE_SHIFT};
use crate::error::{ExtAllocError, Result};

/// Most blocks a page can hold (1MB page of 4KB blocks)
pub const MAX_BLOCKS_PER_PAGE: usize = (1usize << SMALL_PAGE_SHIFT) / BLOCK_ALIGNMENT as usize;

const BITMAP_WORDS: usize = MAX_BLOCKS_PER_PAGE / 64;

/// Index-based handle to a page: owning segment plus slot inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRef {
    pub segment: SegmentId,
    pub slot: u16,
}

#[derive(Debug, Clone)]
pub struct Page {
    /// Absolute offset of block 0
    offset: u64,
    bin: usize,
    block_size: u64,
    capacity: u16,
    used: u16,
    reserved: u16,
    /// Released block indices, most recent last
    free: Vec<u16>,
    /// One bit per block, set while allocated
    live: [u64; BITMAP_WORDS],
    /// Position in the owning bin queue, if queued
    queue_pos: Option<usize>,
}

impl Page {
    pub fn new(offset: u64, page_size: u64, bin: usize, block_size: u64) -> Self {
        let mut page = Page {
            offset,
            bin,
            block_size,
            capacity: 0,
            used: 0,
            reserved: 0,
            free: Vec::new(),
            live: [0; BITMAP_WORDS],
            queue_pos: None,
        };
        page.reset(page_size, bin, block_size);
        page
    }

    /// Re-initialize an empty page for a (possibly different) bin
    pub fn reset(&mut self, page_size: u64, bin: usize, block_size: u64) {
        debug_assert_eq!(self.used, 0, "resetting a page with live blocks");
        let capacity = page_size / block_size;
        debug_assert!(capacity >= 1 && capacity as usize <= MAX_BLOCKS_PER_PAGE);

        self.bin = bin;
        self.block_size = block_size;
        self.capacity = capacity as u16;
        self.used = 0;
        self.reserved = 0;
        self.free.clear();
        self.live = [0; BITMAP_WORDS];
        self.queue_pos = None;
    }

    /// Hand out one block, or `None` if every block is in use
    pub fn try_allocate_block(&mut self) -> Option<u64> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.reserved < self.capacity => {
                self.reserved += 1;
                self.reserved - 1
            }
            None => return None,
        };

        self.set_live(index, true);
        self.used += 1;
        Some(self.block_offset(index))
    }

    /// Return a block. `Ok(true)` means the page is now fully free.
    pub fn release_block(&mut self, offset: u64) -> Result<bool> {
        let index = self
            .block_index(offset)
            .ok_or(ExtAllocError::InvalidOffset(offset))?;

        if !self.is_live(index) {
            return Err(ExtAllocError::DoubleFree(offset));
        }

        self.set_live(index, false);
        self.used -= 1;
        self.free.push(index);

        Ok(self.used == 0)
    }

    /// Whether `offset` is the start of a block currently handed out
    pub fn is_allocated(&self, offset: u64) -> bool {
        self.block_index(offset)
            .map(|index| self.is_live(index))
            .unwrap_or(false)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn bin(&self) -> usize {
        self.bin
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn used(&self) -> u16 {
        self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn queue_pos(&self) -> Option<usize> {
        self.queue_pos
    }

    pub fn set_queue_pos(&mut self, pos: Option<usize>) {
        self.queue_pos = pos;
    }

    fn block_offset(&self, index: u16) -> u64 {
        self.offset + index as u64 * self.block_size
    }

    /// Block index of `offset`, if it is the start of a block ever handed out
    fn block_index(&self, offset: u64) -> Option<u16> {
        let relative = offset.checked_sub(self.offset)?;
        if relative % self.block_size != 0 {
            return None;
        }
        let index = relative / self.block_size;
        (index < self.reserved as u64).then_some(index as u16)
    }

    fn is_live(&self, index: u16) -> bool {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        self.live[word] & (1u64 << bit) != 0
    }

    fn set_live(&mut self, index: u16, live: bool) {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        if live {
            self.live[word] |= 1u64 << bit;
        } else {
            self.live[word] &= !(1u64 << bit);
        }
    }
}

/// Pages of one bin that still have a free block
///
/// Holds non-owning `PageRef`s; each queued page records its position so it
/// can be unlinked in O(1).
#[derive(Debug, Default, Clone)]
pub struct BinQueue {
    pages: Vec<PageRef>,
}

impl BinQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently queued page
    pub fn peek(&self) -> Option<PageRef> {
        self.pages.last().copied()
    }

    /// Append a page, returning its position
    pub fn push(&mut self, page: PageRef) -> usize {
        self.pages.push(page);
        self.pages.len() - 1
    }

    /// Unlink the page at `pos`. Returns the page moved into `pos`, whose
    /// recorded position the caller must update.
    pub fn swap_remove(&mut self, pos: usize) -> Option<PageRef> {
        self.pages.swap_remove(pos);
        self.pages.get(pos).copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
