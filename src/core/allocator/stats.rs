//! Allocator statistics snapshot

use super::registry::SegmentRegistry;
use super::segment::SegmentState;
use super::{PageClass, SEGMENT_SIZE};
use serde::{Deserialize, Serialize};

/// Point-in-time view of allocator usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationStats {
    /// Bytes ever supplied via growth
    pub capacity: u64,
    /// Bytes currently live (block sizes, not request sizes)
    pub allocated_bytes: u64,
    /// Supplied bytes not yet carved into a segment
    pub pending_bytes: u64,
    pub segments: usize,
    pub vacant_segments: usize,
    pub small_segments: usize,
    pub medium_segments: usize,
    pub large_segments: usize,
    /// Segment slots held by blocks larger than one segment
    pub spanned_segments: usize,
    /// Pages currently serving a bin
    pub pages_in_use: usize,
    /// Live LARGE extents inside single segments
    pub live_extents: usize,
    /// Free extents across LARGE segments (fragmentation indicator)
    pub free_extents: usize,
    /// Longest free extent in any LARGE segment
    pub largest_free_extent: u64,
}

impl AllocationStats {
    pub(crate) fn collect(registry: &SegmentRegistry, allocated_bytes: u64) -> Self {
        let mut stats = AllocationStats {
            capacity: registry.capacity(),
            allocated_bytes,
            pending_bytes: registry.pending_bytes(),
            segments: registry.segments().len(),
            ..Default::default()
        };

        for segment in registry.segments() {
            match segment.state() {
                SegmentState::Unclassified => stats.vacant_segments += 1,
                SegmentState::Paged(paged) => {
                    match paged.class() {
                        PageClass::Small => stats.small_segments += 1,
                        _ => stats.medium_segments += 1,
                    }
                    stats.pages_in_use += paged.used_pages() as usize;
                }
                SegmentState::Large(pool) => {
                    stats.large_segments += 1;
                    stats.live_extents += pool.live_count();
                    stats.free_extents += pool.extent_count();
                    stats.largest_free_extent = stats.largest_free_extent.max(pool.largest_free());
                }
                SegmentState::SpanHead { .. } | SegmentState::SpanTail { .. } => {
                    stats.spanned_segments += 1
                }
            }
        }

        stats
    }

    /// Share of segment-backed storage holding live blocks (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        let claimed = self.segments as u64 * SEGMENT_SIZE;
        if claimed == 0 {
            return 0.0;
        }
        (self.allocated_bytes as f64 / claimed as f64).min(1.0)
    }
}
