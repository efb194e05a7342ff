//! Segment descriptors
//!
//! A segment owns one 256MB slot of the address space. Its page class is
//! decided lazily by the first demand and dropped again once the segment is
//! fully free, so any class can claim it next.

use super::extent::ExtentPool;
use super::page::Page;
use super::{segment_offset, PageClass, SegmentId, SEGMENT_SHIFT, SEGMENT_SIZE};
use crate::error::{ExtAllocError, Result};

/// Lifecycle state of a segment
#[derive(Debug, Clone)]
pub enum SegmentState {
    /// Fully free, no page class
    Unclassified,
    /// SMALL or MEDIUM: fixed-size page slots
    Paged(PagedSegment),
    /// LARGE blocks up to one segment, carved as extents
    Large(ExtentPool),
    /// First slot of a LARGE block spanning `segments` contiguous slots
    SpanHead { segments: u64, block_size: u64 },
    /// Follower slot of a spanning block
    SpanTail { head: SegmentId },
}

/// Page slots of a SMALL or MEDIUM segment
#[derive(Debug, Clone)]
pub struct PagedSegment {
    class: PageClass,
    page_shift: u32,
    /// Carved pages, indexed by slot
    pages: Vec<Page>,
    /// Carved slots whose page is empty, most recent last
    free_slots: Vec<u16>,
    used: u16,
}

impl PagedSegment {
    fn new(class: PageClass, page_shift: u32) -> Self {
        PagedSegment {
            class,
            page_shift,
            pages: Vec::new(),
            free_slots: Vec::new(),
            used: 0,
        }
    }

    pub fn class(&self) -> PageClass {
        self.class
    }

    pub fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    pub fn slot_count(&self) -> usize {
        1 << (SEGMENT_SHIFT - self.page_shift)
    }

    pub fn has_spare(&self) -> bool {
        !self.free_slots.is_empty() || self.pages.len() < self.slot_count()
    }

    pub fn used_pages(&self) -> u16 {
        self.used
    }

    /// Slot holding `offset`, given the segment base
    pub fn slot_of(&self, base: u64, offset: u64) -> u16 {
        ((offset - base) >> self.page_shift) as u16
    }

    pub fn page(&self, slot: u16) -> Option<&Page> {
        self.pages.get(slot as usize)
    }

    pub fn page_mut(&mut self, slot: u16) -> Option<&mut Page> {
        self.pages.get_mut(slot as usize)
    }

    /// Whether `slot` holds a page serving a bin right now
    pub fn is_active(&self, slot: u16) -> bool {
        (slot as usize) < self.pages.len() && !self.free_slots.contains(&slot)
    }

    /// Reuse an emptied page first, otherwise carve the next untouched slot
    fn carve(&mut self, base: u64, bin: usize, block_size: u64) -> Option<u16> {
        let page_size = self.page_size();
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.pages[slot as usize].reset(page_size, bin, block_size);
            slot
        } else if self.pages.len() < self.slot_count() {
            let slot = self.pages.len() as u16;
            let offset = base + ((slot as u64) << self.page_shift);
            self.pages.push(Page::new(offset, page_size, bin, block_size));
            slot
        } else {
            return None;
        };

        self.used += 1;
        Some(slot)
    }

    fn reclaim(&mut self, slot: u16) -> bool {
        debug_assert!(self.pages[slot as usize].is_empty());
        self.free_slots.push(slot);
        self.used -= 1;
        self.used == 0
    }
}

#[derive(Debug, Clone)]
pub struct SegmentDescr {
    id: SegmentId,
    state: SegmentState,
}

impl SegmentDescr {
    pub fn new(id: SegmentId) -> Self {
        SegmentDescr {
            id,
            state: SegmentState::Unclassified,
        }
    }

    pub fn offset(&self) -> u64 {
        segment_offset(self.id)
    }

    pub fn state(&self) -> &SegmentState {
        &self.state
    }

    pub fn page_class(&self) -> Option<PageClass> {
        match &self.state {
            SegmentState::Unclassified => None,
            SegmentState::Paged(paged) => Some(paged.class),
            SegmentState::Large(_)
            | SegmentState::SpanHead { .. }
            | SegmentState::SpanTail { .. } => Some(PageClass::Large),
        }
    }

    pub fn is_vacant(&self) -> bool {
        matches!(self.state, SegmentState::Unclassified)
    }

    /// Assign a page class to a vacant segment
    pub fn classify(&mut self, class: PageClass) {
        debug_assert!(self.is_vacant(), "segment {} already classified", self.id);
        self.state = match class.page_shift() {
            Some(shift) => SegmentState::Paged(PagedSegment::new(class, shift)),
            None => SegmentState::Large(ExtentPool::new(self.offset(), SEGMENT_SIZE)),
        };
    }

    /// Back to vacant; every page and extent is folded away
    pub fn unclassify(&mut self) {
        self.state = SegmentState::Unclassified;
    }

    pub fn mark_span_head(&mut self, segments: u64, block_size: u64) {
        self.state = SegmentState::SpanHead {
            segments,
            block_size,
        };
    }

    pub fn mark_span_tail(&mut self, head: SegmentId) {
        self.state = SegmentState::SpanTail { head };
    }

    /// Whether another page (or any extent) can be carved here
    pub fn has_spare(&self) -> bool {
        match &self.state {
            SegmentState::Unclassified => true,
            SegmentState::Paged(paged) => paged.has_spare(),
            SegmentState::Large(pool) => pool.free_bytes() > 0,
            SegmentState::SpanHead { .. } | SegmentState::SpanTail { .. } => false,
        }
    }

    /// Carve a page for `bin`, classifying the segment on first demand.
    /// Returns `None` when the segment is exhausted or of another class.
    pub fn carve_page(&mut self, bin: usize, block_size: u64, class: PageClass) -> Option<u16> {
        if self.is_vacant() {
            self.classify(class);
        }

        let base = self.offset();
        match &mut self.state {
            SegmentState::Paged(paged) if paged.class == class => paged.carve(base, bin, block_size),
            _ => {
                debug_assert!(false, "segment {} cannot serve {:?} pages", self.id, class);
                None
            }
        }
    }

    /// Return an emptied page slot. `true` means the segment went back to
    /// unclassified.
    pub fn reclaim_page(&mut self, slot: u16) -> bool {
        let now_empty = match &mut self.state {
            SegmentState::Paged(paged) => paged.reclaim(slot),
            _ => false,
        };

        if now_empty {
            self.unclassify();
        }
        now_empty
    }

    /// Carve a LARGE extent, classifying the segment on first demand
    pub fn allocate_extent(&mut self, length: u64) -> Option<u64> {
        if self.is_vacant() {
            self.classify(PageClass::Large);
        }

        match &mut self.state {
            SegmentState::Large(pool) => pool.allocate(length),
            _ => None,
        }
    }

    /// Release a LARGE extent. `Ok(true)` means the segment went back to
    /// unclassified.
    pub fn release_extent(&mut self, offset: u64, length: u64) -> Result<bool> {
        let now_empty = match &mut self.state {
            SegmentState::Large(pool) => pool.release(offset, length)?,
            SegmentState::Unclassified => return Err(ExtAllocError::InvalidOffset(offset)),
            _ => {
                return Err(ExtAllocError::SizeMismatch {
                    offset,
                    size: length,
                })
            }
        };

        if now_empty {
            self.unclassify();
        }
        Ok(now_empty)
    }

    pub fn paged(&self) -> Option<&PagedSegment> {
        match &self.state {
            SegmentState::Paged(paged) => Some(paged),
            _ => None,
        }
    }

    pub fn paged_mut(&mut self) -> Option<&mut PagedSegment> {
        match &mut self.state {
            SegmentState::Paged(paged) => Some(paged),
            _ => None,
        }
    }

    /// Whether `offset` is the start of a live block in this segment
    pub fn is_allocated(&self, offset: u64) -> bool {
        match &self.state {
            SegmentState::Unclassified | SegmentState::SpanTail { .. } => false,
            SegmentState::Paged(paged) => {
                let slot = paged.slot_of(self.offset(), offset);
                paged.is_active(slot)
                    && paged.page(slot).is_some_and(|page| page.is_allocated(offset))
            }
            SegmentState::Large(pool) => pool.is_allocated(offset),
            SegmentState::SpanHead { .. } => offset == self.offset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{MEDIUM_PAGE_SHIFT, SMALL_PAGE_SHIFT};

    #[test]
    fn test_new_segment_is_vacant() {
        let segment = SegmentDescr::new(2);
        assert!(segment.is_vacant());
        assert_eq!(segment.page_class(), None);
        assert_eq!(segment.offset(), 2 * SEGMENT_SIZE);
    }

    #[test]
    fn test_first_carve_classifies() {
        let mut segment = SegmentDescr::new(1);
        let slot = segment.carve_page(0, 4096, PageClass::Small).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(segment.page_class(), Some(PageClass::Small));

        let paged = segment.paged().unwrap();
        assert_eq!(paged.slot_count(), 256);
        assert_eq!(paged.page(0).unwrap().offset(), SEGMENT_SIZE);
        assert_eq!(paged.used_pages(), 1);
    }

    #[test]
    fn test_medium_segment_exhausts() {
        let mut segment = SegmentDescr::new(0);
        for slot in 0..32 {
            assert_eq!(segment.carve_page(33, 1 << 20, PageClass::Medium), Some(slot));
        }
        assert!(!segment.has_spare());
        assert_eq!(segment.carve_page(33, 1 << 20, PageClass::Medium), None);

        let page = segment.paged().unwrap().page(31).unwrap();
        assert_eq!(page.offset(), 31 << MEDIUM_PAGE_SHIFT);
    }

    #[test]
    fn test_reclaimed_slot_is_reused() {
        let mut segment = SegmentDescr::new(0);
        let a = segment.carve_page(0, 4096, PageClass::Small).unwrap();
        let b = segment.carve_page(0, 4096, PageClass::Small).unwrap();

        assert!(!segment.reclaim_page(a));
        assert!(!segment.paged().unwrap().is_active(a));

        // emptied page comes back for a different bin of the same class
        let c = segment.carve_page(5, 24 * 1024, PageClass::Small).unwrap();
        assert_eq!(c, a);
        let page = segment.paged().unwrap().page(c).unwrap();
        assert_eq!(page.bin(), 5);
        assert_eq!(page.offset(), (c as u64) << SMALL_PAGE_SHIFT);

        assert!(!segment.reclaim_page(b));
        assert!(segment.reclaim_page(c));
        assert!(segment.is_vacant());
    }

    #[test]
    fn test_vacant_segment_reclassifies() {
        let mut segment = SegmentDescr::new(0);
        let slot = segment.carve_page(0, 4096, PageClass::Small).unwrap();
        assert!(segment.reclaim_page(slot));

        let offset = segment.allocate_extent(8 << 20).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(segment.page_class(), Some(PageClass::Large));
        assert!(segment.is_allocated(0));
    }

    #[test]
    fn test_large_extent_lifecycle() {
        let mut segment = SegmentDescr::new(3);
        let a = segment.allocate_extent(2 << 20).unwrap();
        let b = segment.allocate_extent(3 << 20).unwrap();
        assert_eq!(a, 3 * SEGMENT_SIZE);
        assert_eq!(b, a + (2 << 20));

        assert!(!segment.release_extent(a, 2 << 20).unwrap());
        assert!(segment.release_extent(b, 3 << 20).unwrap());
        assert!(segment.is_vacant());
    }

    #[test]
    fn test_release_extent_on_wrong_state() {
        let mut segment = SegmentDescr::new(0);
        assert!(matches!(
            segment.release_extent(0, 2 << 20),
            Err(ExtAllocError::InvalidOffset(0))
        ));

        segment.carve_page(0, 4096, PageClass::Small).unwrap();
        assert!(matches!(
            segment.release_extent(0, 2 << 20),
            Err(ExtAllocError::SizeMismatch { .. })
        ));
    }
}
