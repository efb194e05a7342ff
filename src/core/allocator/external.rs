//! External allocator
//!
//! Decides where a byte range lives in storage it never touches. A request
//! walks four states until one succeeds:
//! 1. a page of its bin with a free block
//! 2. a new page carved from a segment of its page class with a spare slot
//! 3. a new page carved from a brand-new (or recycled) segment
//! 4. a shortfall: the caller grows storage by that many bytes and retries
//!
//! The allocator is single-threaded and takes no locks; wrap it in
//! [`SharedAllocator`](crate::shared::SharedAllocator) or confine it to one
//! worker when several contexts need it.

use super::page::{BinQueue, PageRef};
use super::registry::SegmentRegistry;
use super::size_class::SizeClass;
use super::stats::AllocationStats;
use super::{segment_id, PageClass, LARGE_BIN, MAX_ALLOCATION_SIZE, SEGMENT_SIZE};
use crate::config::AllocatorConfig;
use crate::error::{ExtAllocError, Result};
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct ExternalAllocator {
    registry: SegmentRegistry,

    /// Pages with at least one free block, per bin
    bins: Vec<BinQueue>,

    /// Bytes currently live, in block sizes
    allocated_bytes: u64,

    capacity_limit: Option<u64>,
}

impl Default for ExternalAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalAllocator {
    /// Create an allocator with no backing storage
    pub fn new() -> Self {
        ExternalAllocator {
            registry: SegmentRegistry::new(),
            bins: vec![BinQueue::new(); LARGE_BIN],
            allocated_bytes: 0,
            capacity_limit: None,
        }
    }

    pub fn with_config(config: AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let mut alloc = Self::new();
        alloc.capacity_limit = config.capacity_limit;
        if config.initial_capacity > 0 {
            alloc.grow_by(0, config.initial_capacity)?;
        }
        Ok(alloc)
    }

    pub fn builder() -> ExternalAllocatorBuilder {
        ExternalAllocatorBuilder::new()
    }

    /// Find room for `size` bytes.
    ///
    /// Returns the absolute offset of a block of `good_size(size)` bytes, or
    /// [`ExtAllocError::NeedStorage`] with the exact number of bytes to add
    /// via [`grow_by`](Self::grow_by) before retrying the same request.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            warn!("Rejected zero-sized allocation");
            return Err(ExtAllocError::ZeroSize);
        }
        if size > MAX_ALLOCATION_SIZE {
            warn!("Rejected allocation of {} bytes", size);
            return Err(ExtAllocError::TooLarge(size));
        }

        let class = SizeClass::of(size);
        let result = match class.page_class {
            PageClass::Large if class.block_size > SEGMENT_SIZE => {
                self.registry.reserve_span(class.block_size)
            }
            PageClass::Large => self.registry.allocate_extent(class.block_size),
            PageClass::Small | PageClass::Medium => self.allocate_block(class),
        };

        let offset = match result {
            Ok(offset) => offset,
            Err(ExtAllocError::NeedStorage { required }) => return Err(self.shortfall(required)),
            Err(err) => return Err(err),
        };

        self.allocated_bytes += class.block_size;
        trace!(
            "Allocated {} bytes (bin {}) at offset {}",
            class.block_size,
            class.bin,
            offset
        );
        Ok(offset)
    }

    /// `allocate` with the signed return channel: a non-negative offset, or
    /// the negated number of bytes of storage still required.
    ///
    /// # Panics
    ///
    /// Panics on contract violations (zero or oversized requests, or a
    /// request that would exceed the configured capacity limit).
    pub fn malloc(&mut self, size: u64) -> i64 {
        match self.allocate(size) {
            Ok(offset) => offset as i64,
            Err(ExtAllocError::NeedStorage { required }) => -(required as i64),
            Err(err) => panic!("malloc({}) violated the allocator contract: {}", size, err),
        }
    }

    /// Free a block. `size` must be the size passed to the matching
    /// `allocate`; the block is located from it, not from stored metadata.
    pub fn release(&mut self, offset: u64, size: u64) -> Result<()> {
        let result = self.try_release(offset, size);
        match &result {
            Ok(block_size) => {
                self.allocated_bytes -= block_size;
                trace!("Released {} bytes at offset {}", block_size, offset);
            }
            Err(err) => warn!("Rejected release of {} bytes at {}: {}", size, offset, err),
        }
        result.map(|_| ())
    }

    /// `release` that treats every rejected release as a fatal bug.
    ///
    /// # Panics
    ///
    /// Panics if `offset`/`size` do not name a live block.
    pub fn free(&mut self, offset: u64, size: u64) {
        if let Err(err) = self.release(offset, size) {
            panic!("free({}, {}) violated the allocator contract: {}", offset, size, err);
        }
    }

    /// Add backing storage. `offset` must equal [`capacity`](Self::capacity)
    /// and both values must be multiples of the segment size (256MB).
    pub fn grow_by(&mut self, offset: u64, size: u64) -> Result<()> {
        if let Some(limit) = self.capacity_limit {
            if self.capacity().saturating_add(size) > limit {
                warn!("Growth by {} bytes would exceed limit {}", size, limit);
                return Err(ExtAllocError::CapacityLimit {
                    limit,
                    requested: size,
                });
            }
        }
        self.registry.grow_by(offset, size)
    }

    /// Allocate, growing the medium through `grow` until the request fits.
    ///
    /// `grow(offset, len)` must make `[offset, offset + len)` usable on the
    /// medium; if it fails, its error is returned and nothing changes.
    pub fn allocate_or_grow<F, E>(&mut self, size: u64, mut grow: F) -> std::result::Result<u64, E>
    where
        F: FnMut(u64, u64) -> std::result::Result<(), E>,
        E: From<ExtAllocError>,
    {
        loop {
            match self.allocate(size) {
                Ok(offset) => return Ok(offset),
                Err(ExtAllocError::NeedStorage { required }) => {
                    let offset = self.capacity();
                    debug!("Growing backing storage by {} bytes at {}", required, offset);
                    grow(offset, required)?;
                    self.grow_by(offset, required)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Block size `allocate(size)` would use. No allocation is done.
    pub fn good_size(size: u64) -> u64 {
        super::size_class::good_size(size)
    }

    /// Total bytes ever supplied via growth
    pub fn capacity(&self) -> u64 {
        self.registry.capacity()
    }

    /// Bytes currently live (allocated minus released)
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn capacity_limit(&self) -> Option<u64> {
        self.capacity_limit
    }

    /// Whether `offset` is the start of a live block
    pub fn is_allocated(&self, offset: u64) -> bool {
        offset < self.capacity() && self.registry.is_allocated(offset)
    }

    pub fn stats(&self) -> AllocationStats {
        AllocationStats::collect(&self.registry, self.allocated_bytes)
    }

    fn shortfall(&self, required: u64) -> ExtAllocError {
        if let Some(limit) = self.capacity_limit {
            if self.capacity() + required > limit {
                warn!(
                    "Need {} more bytes but capacity limit is {}",
                    required, limit
                );
                return ExtAllocError::CapacityLimit {
                    limit,
                    requested: required,
                };
            }
        }

        debug!("Backing storage exhausted, {} more bytes required", required);
        ExtAllocError::NeedStorage { required }
    }

    fn allocate_block(&mut self, class: SizeClass) -> Result<u64> {
        loop {
            if let Some(page_ref) = self.bins[class.bin].peek() {
                let mut taken = None;
                if let Some(page) = self.registry.page_mut(page_ref) {
                    if let Some(offset) = page.try_allocate_block() {
                        taken = Some((offset, page.is_full()));
                    }
                }

                match taken {
                    Some((offset, full)) => {
                        if full {
                            self.dequeue(class.bin, page_ref);
                        }
                        return Ok(offset);
                    }
                    None => {
                        // stale entry; drop it and look again
                        warn!("Bin {} queued unusable page {:?}", class.bin, page_ref);
                        let last = self.bins[class.bin].len() - 1;
                        self.bins[class.bin].swap_remove(last);
                        if let Some(page) = self.registry.page_mut(page_ref) {
                            page.set_queue_pos(None);
                        }
                        continue;
                    }
                }
            }

            let page_ref = self.carve_page(class)?;
            self.enqueue(class.bin, page_ref);
        }
    }

    /// Carve a fresh page for `class` from a spare or new segment
    fn carve_page(&mut self, class: SizeClass) -> Result<PageRef> {
        loop {
            let id = match self.registry.spare_segment(class.page_class) {
                Some(id) => id,
                None => self.registry.request_new_segment(class.page_class)?,
            };

            let Some(segment) = self.registry.get_mut(id) else {
                self.registry.clear_spare(class.page_class, id);
                continue;
            };
            let slot = segment.carve_page(class.bin, class.block_size, class.page_class);
            if !segment.has_spare() {
                self.registry.clear_spare(class.page_class, id);
            }

            if let Some(slot) = slot {
                debug!(
                    "Carved page {} of segment {} for bin {} ({} byte blocks)",
                    slot, id, class.bin, class.block_size
                );
                return Ok(PageRef { segment: id, slot });
            }
        }
    }

    /// Release without touching the live-byte counter; returns the block size
    fn try_release(&mut self, offset: u64, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(ExtAllocError::ZeroSize);
        }
        if size > MAX_ALLOCATION_SIZE {
            return Err(ExtAllocError::TooLarge(size));
        }
        if offset >= self.capacity() {
            return Err(ExtAllocError::InvalidOffset(offset));
        }

        let class = SizeClass::of(size);
        match class.page_class {
            PageClass::Large if class.block_size > SEGMENT_SIZE => {
                self.registry.release_span(offset, class.block_size)?
            }
            PageClass::Large => self.registry.release_extent(offset, class.block_size)?,
            PageClass::Small | PageClass::Medium => self.release_block(offset, class)?,
        }
        Ok(class.block_size)
    }

    fn release_block(&mut self, offset: u64, class: SizeClass) -> Result<()> {
        let id = segment_id(offset);
        let mismatch = ExtAllocError::SizeMismatch {
            offset,
            size: class.block_size,
        };

        let segment = self
            .registry
            .get_mut(id)
            .ok_or(ExtAllocError::InvalidOffset(offset))?;
        if segment.is_vacant() {
            return Err(ExtAllocError::InvalidOffset(offset));
        }

        let base = segment.offset();
        let Some(paged) = segment
            .paged_mut()
            .filter(|paged| paged.class() == class.page_class)
        else {
            return Err(mismatch);
        };

        let slot = paged.slot_of(base, offset);
        let page = paged
            .page_mut(slot)
            .ok_or(ExtAllocError::InvalidOffset(offset))?;
        if page.bin() != class.bin {
            return Err(mismatch);
        }

        let was_full = page.is_full();
        let emptied = page.release_block(offset)?;
        let page_ref = PageRef { segment: id, slot };

        if emptied {
            self.dequeue(class.bin, page_ref);
            let recycled = self
                .registry
                .get_mut(id)
                .is_some_and(|segment| segment.reclaim_page(slot));
            if recycled {
                self.registry.recycle(id);
            } else {
                self.registry.mark_spare(class.page_class, id);
            }
        } else if was_full {
            self.enqueue(class.bin, page_ref);
        }

        Ok(())
    }

    fn enqueue(&mut self, bin: usize, page_ref: PageRef) {
        let pos = self.bins[bin].push(page_ref);
        if let Some(page) = self.registry.page_mut(page_ref) {
            debug_assert!(page.queue_pos().is_none(), "page {:?} queued twice", page_ref);
            page.set_queue_pos(Some(pos));
        }
    }

    fn dequeue(&mut self, bin: usize, page_ref: PageRef) {
        let pos = match self.registry.page_mut(page_ref) {
            Some(page) => match page.queue_pos() {
                Some(pos) => {
                    page.set_queue_pos(None);
                    pos
                }
                None => return,
            },
            None => return,
        };

        if let Some(moved) = self.bins[bin].swap_remove(pos) {
            if let Some(page) = self.registry.page_mut(moved) {
                page.set_queue_pos(Some(pos));
            }
        }
    }
}

/// Builder for [`ExternalAllocator`]
#[derive(Debug, Default, Clone)]
pub struct ExternalAllocatorBuilder {
    config: AllocatorConfig,
}

impl ExternalAllocatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage already available at offset 0
    pub fn initial_capacity(mut self, bytes: u64) -> Self {
        self.config.initial_capacity = bytes;
        self
    }

    /// Never grow past `bytes` of total capacity
    pub fn capacity_limit(mut self, bytes: u64) -> Self {
        self.config.capacity_limit = Some(bytes);
        self
    }

    pub fn config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ExternalAllocator> {
        ExternalAllocator::with_config(self.config)
    }
}
