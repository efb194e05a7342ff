//! Bookkeeping allocator for externally owned storage
//!
//! The address space is carved the way mimalloc carves memory:
//! - Segments: 256MB aligned units, the unit of growth and recycling
//! - Pages: 1MB (SMALL) or 8MB (MEDIUM) slices of a segment, one bin each
//! - Blocks: equal-size slots of a page, or exact-fit extents for LARGE
//!
//! Nothing here touches the medium. Every operation returns offsets (or a
//! shortfall) immediately, so it can run inside non-blocking call chains.

pub mod extent;
pub mod external;
pub mod page;
pub mod registry;
pub mod segment;
pub mod size_class;
pub mod stats;

use serde::{Deserialize, Serialize};

pub use external::ExternalAllocator;
pub use size_class::{good_size, SizeClass};
pub use stats::AllocationStats;

/// log2 of the segment size
pub const SEGMENT_SHIFT: u32 = 28;

/// Segment size and growth alignment (256MB)
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;

/// log2 of the SMALL page size (1MB)
pub const SMALL_PAGE_SHIFT: u32 = 20;

/// log2 of the MEDIUM page size (8MB)
pub const MEDIUM_PAGE_SHIFT: u32 = 23;

/// Granularity of every block size and offset handed out (4KB)
pub const BLOCK_ALIGNMENT: u64 = 4096;

/// Largest block served from SMALL pages (128KB)
pub const SMALL_MAX_SIZE: u64 = 128 * 1024;

/// Largest block served from MEDIUM pages (1MB)
pub const MEDIUM_MAX_SIZE: u64 = 1024 * 1024;

/// Largest total capacity accepted; segment ids stay within `u32` and
/// every offset or shortfall fits in an `i64`
pub const MAX_CAPACITY: u64 = 1 << 60;

/// Largest request accepted
pub const MAX_ALLOCATION_SIZE: u64 = MAX_CAPACITY;

/// Catch-all bin for LARGE requests
pub const LARGE_BIN: usize = 34;

/// Index of a segment: its offset shifted right by `SEGMENT_SHIFT`
pub type SegmentId = u32;

/// Page class shared by every page of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PageClass {
    /// 1MB pages, blocks up to 128KB
    Small = 0,
    /// 8MB pages, blocks up to 1MB
    Medium = 1,
    /// Exact-fit extents, blocks above 1MB
    Large = 2,
}

impl PageClass {
    pub const ALL: [PageClass; 3] = [PageClass::Small, PageClass::Medium, PageClass::Large];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Page shift for classes carved into fixed-size pages
    pub fn page_shift(self) -> Option<u32> {
        match self {
            PageClass::Small => Some(SMALL_PAGE_SHIFT),
            PageClass::Medium => Some(MEDIUM_PAGE_SHIFT),
            PageClass::Large => None,
        }
    }
}

/// Segment id owning an absolute offset
pub fn segment_id(offset: u64) -> SegmentId {
    (offset >> SEGMENT_SHIFT) as SegmentId
}

/// Absolute offset of a segment
pub fn segment_offset(id: SegmentId) -> u64 {
    (id as u64) << SEGMENT_SHIFT
}

/// Round `size` up to a multiple of `SEGMENT_SIZE`
pub fn segment_align_up(size: u64) -> u64 {
    size.div_ceil(SEGMENT_SIZE) * SEGMENT_SIZE
}
