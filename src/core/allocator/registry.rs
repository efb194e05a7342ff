//! Segment registry and pending storage
//!
//! Segments are stored densely by id (offset >> 28). Storage handed over by
//! `grow_by` waits in the pending queue until some page class demands a new
//! segment, since the class is unknown before that.

use super::segment::{SegmentDescr, SegmentState};
use super::page::{Page, PageRef};
use super::{segment_id, segment_offset, PageClass, SegmentId, MAX_CAPACITY, SEGMENT_SIZE};
use crate::error::{ExtAllocError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Supplied-but-uncarved storage, consumed in ascending offset order
#[derive(Debug, Default, Clone)]
pub struct PendingStorage {
    /// start offset -> length
    ranges: BTreeMap<u64, u64>,
    bytes: u64,
}

impl PendingStorage {
    pub fn push(&mut self, offset: u64, size: u64) {
        self.ranges.insert(offset, size);
        self.bytes += size;
    }

    /// Take one segment-sized unit starting exactly at `expected`
    pub fn take_unit(&mut self, expected: u64) -> Option<u64> {
        let (&offset, &size) = self.ranges.first_key_value()?;
        if offset != expected || size < SEGMENT_SIZE {
            return None;
        }

        self.ranges.remove(&offset);
        if size > SEGMENT_SIZE {
            self.ranges.insert(offset + SEGMENT_SIZE, size - SEGMENT_SIZE);
        }
        self.bytes -= SEGMENT_SIZE;

        Some(offset)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whole segments available
    pub fn units(&self) -> u64 {
        self.bytes / SEGMENT_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Owner of every segment plus the queues used to find one quickly
#[derive(Debug, Clone)]
pub struct SegmentRegistry {
    segments: Vec<SegmentDescr>,

    /// Per page class: segments that can still carve a page or extent
    spare: [BTreeSet<SegmentId>; 3],

    /// Unclassified, fully free segments
    vacant: BTreeSet<SegmentId>,

    pending: PendingStorage,

    /// Total bytes ever supplied via `grow_by`
    capacity: u64,
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentRegistry {
    pub fn new() -> Self {
        SegmentRegistry {
            segments: Vec::new(),
            spare: Default::default(),
            vacant: BTreeSet::new(),
            pending: PendingStorage::default(),
            capacity: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.bytes()
    }

    pub fn segments(&self) -> &[SegmentDescr] {
        &self.segments
    }

    pub fn get(&self, id: SegmentId) -> Option<&SegmentDescr> {
        self.segments.get(id as usize)
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Option<&mut SegmentDescr> {
        self.segments.get_mut(id as usize)
    }

    /// Page behind a `PageRef`, if its segment is still paged
    pub fn page_mut(&mut self, page: PageRef) -> Option<&mut Page> {
        self.get_mut(page.segment)?.paged_mut()?.page_mut(page.slot)
    }

    pub fn vacant_count(&self) -> usize {
        self.vacant.len()
    }

    /// Append storage. `offset` must equal the current capacity and both
    /// values must be segment aligned.
    pub fn grow_by(&mut self, offset: u64, size: u64) -> Result<()> {
        if size == 0 || offset % SEGMENT_SIZE != 0 || size % SEGMENT_SIZE != 0 {
            warn!("Rejected misaligned growth at {} of {} bytes", offset, size);
            return Err(ExtAllocError::MisalignedGrowth { offset, size });
        }
        if offset != self.capacity {
            warn!(
                "Rejected non-contiguous growth at {} (capacity is {})",
                offset, self.capacity
            );
            return Err(ExtAllocError::NonContiguousGrowth {
                expected: self.capacity,
                offset,
            });
        }

        let capacity = self
            .capacity
            .checked_add(size)
            .filter(|&capacity| capacity <= MAX_CAPACITY)
            .ok_or(ExtAllocError::TooLarge(size))?;

        self.pending.push(offset, size);
        self.capacity = capacity;

        info!(
            "Added {} bytes of backing storage at {}, capacity now {}",
            size, offset, self.capacity
        );
        Ok(())
    }

    /// First segment of `class` with a spare page or free extent
    pub fn spare_segment(&self, class: PageClass) -> Option<SegmentId> {
        self.spare[class.index()].first().copied()
    }

    pub fn mark_spare(&mut self, class: PageClass, id: SegmentId) {
        self.spare[class.index()].insert(id);
    }

    pub fn clear_spare(&mut self, class: PageClass, id: SegmentId) {
        self.spare[class.index()].remove(&id);
    }

    /// A segment classified for `class`: a recycled vacant one if possible,
    /// otherwise a fresh one carved from pending storage.
    pub fn request_new_segment(&mut self, class: PageClass) -> Result<SegmentId> {
        let id = match self.vacant.pop_first() {
            Some(id) => {
                debug!("Reusing vacant segment {} for {:?} pages", id, class);
                id
            }
            None => self.materialize_segment().ok_or(ExtAllocError::NeedStorage {
                required: SEGMENT_SIZE,
            })?,
        };

        self.segments[id as usize].classify(class);
        self.mark_spare(class, id);
        Ok(id)
    }

    /// Turn the next pending unit into an unclassified segment
    fn materialize_segment(&mut self) -> Option<SegmentId> {
        let id = self.segments.len() as SegmentId;
        let offset = self.pending.take_unit(segment_offset(id))?;
        debug_assert_eq!(segment_id(offset), id);

        self.segments.push(SegmentDescr::new(id));
        debug!("Created segment {} at offset {}", id, offset);
        Some(id)
    }

    /// Called once a segment has dropped back to unclassified
    pub fn recycle(&mut self, id: SegmentId) {
        debug_assert!(self.segments[id as usize].is_vacant());
        for spare in &mut self.spare {
            spare.remove(&id);
        }
        self.vacant.insert(id);
        debug!("Segment {} is fully free and unclassified", id);
    }

    /// Carve a LARGE extent of at most one segment, first-fit across LARGE
    /// segments in id order, then from a new segment.
    pub fn allocate_extent(&mut self, length: u64) -> Result<u64> {
        debug_assert!(length <= SEGMENT_SIZE);

        let mut found = None;
        for &id in &self.spare[PageClass::Large.index()] {
            if let Some(offset) = self.segments[id as usize].allocate_extent(length) {
                found = Some((id, offset));
                break;
            }
        }

        let (id, offset) = match found {
            Some(hit) => hit,
            None => {
                let id = self.request_new_segment(PageClass::Large)?;
                let offset = self.segments[id as usize]
                    .allocate_extent(length)
                    .ok_or(ExtAllocError::TooLarge(length))?;
                (id, offset)
            }
        };

        if !self.segments[id as usize].has_spare() {
            self.clear_spare(PageClass::Large, id);
        }
        Ok(offset)
    }

    /// Release a LARGE extent of at most one segment
    pub fn release_extent(&mut self, offset: u64, length: u64) -> Result<()> {
        let id = segment_id(offset);
        let segment = self
            .segments
            .get_mut(id as usize)
            .ok_or(ExtAllocError::InvalidOffset(offset))?;

        if segment.release_extent(offset, length)? {
            self.recycle(id);
        } else {
            self.mark_spare(PageClass::Large, id);
        }
        Ok(())
    }

    /// Reserve contiguous segment slots for a block larger than one segment.
    ///
    /// Vacant runs are searched first-fit; a vacant run at the registry tail
    /// may be extended with pending units. On failure the shortfall covers
    /// exactly the missing slots.
    pub fn reserve_span(&mut self, block_size: u64) -> Result<u64> {
        let count = block_size.div_ceil(SEGMENT_SIZE);

        let mut run_start = 0usize;
        let mut run_len = 0u64;
        for (idx, segment) in self.segments.iter().enumerate() {
            if !segment.is_vacant() {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == count {
                return Ok(self.claim_span(run_start, count, block_size));
            }
        }

        // run_len is now the vacant run touching the tail, if any
        if run_len == 0 {
            run_start = self.segments.len();
        }
        let missing = count - run_len;
        let available = self.pending.units();
        if available < missing {
            return Err(ExtAllocError::NeedStorage {
                required: (missing - available) * SEGMENT_SIZE,
            });
        }

        for _ in 0..missing {
            self.materialize_segment().ok_or(ExtAllocError::NeedStorage {
                required: SEGMENT_SIZE,
            })?;
        }
        Ok(self.claim_span(run_start, count, block_size))
    }

    fn claim_span(&mut self, start: usize, count: u64, block_size: u64) -> u64 {
        let head = start as SegmentId;
        self.segments[start].mark_span_head(count, block_size);
        self.vacant.remove(&head);
        for idx in start + 1..start + count as usize {
            self.segments[idx].mark_span_tail(head);
            self.vacant.remove(&(idx as SegmentId));
        }

        debug!(
            "Reserved {} contiguous segments at {} for {} bytes",
            count, head, block_size
        );
        segment_offset(head)
    }

    /// Release a spanning block; `offset` must be its head segment offset
    pub fn release_span(&mut self, offset: u64, block_size: u64) -> Result<()> {
        let id = segment_id(offset);
        let segment = self
            .segments
            .get(id as usize)
            .ok_or(ExtAllocError::InvalidOffset(offset))?;

        let count = match *segment.state() {
            SegmentState::SpanHead {
                segments,
                block_size: live_size,
            } if offset == segment.offset() => {
                if live_size != block_size {
                    return Err(ExtAllocError::SizeMismatch {
                        offset,
                        size: block_size,
                    });
                }
                segments
            }
            SegmentState::Unclassified => return Err(ExtAllocError::DoubleFree(offset)),
            SegmentState::Paged(_) | SegmentState::Large(_) => {
                return Err(ExtAllocError::SizeMismatch {
                    offset,
                    size: block_size,
                })
            }
            _ => return Err(ExtAllocError::InvalidOffset(offset)),
        };

        let start = id as usize;
        for idx in start..start + count as usize {
            self.segments[idx].unclassify();
            self.recycle(idx as SegmentId);
        }
        Ok(())
    }

    /// Whether `offset` is the start of a live block
    pub fn is_allocated(&self, offset: u64) -> bool {
        self.get(segment_id(offset))
            .is_some_and(|segment| segment.is_allocated(offset))
    }
}
