//! Growth contract integration tests
//!
//! Tests to verify the shortfall / grow / retry loop:
//! - Shortfalls are exact and segment aligned
//! - Supplying the shortfall at `capacity()` makes the retry succeed
//! - Misaligned or non-contiguous growth is rejected

use extalloc::{ExtAllocError, ExternalAllocator, SEGMENT_SIZE};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Allocate, growing by exactly the reported shortfall
fn allocate_growing(alloc: &mut ExternalAllocator, size: u64) -> (u64, u64) {
    let mut grown = 0;
    loop {
        let result = alloc.malloc(size);
        if result >= 0 {
            return (result as u64, grown);
        }
        let required = (-result) as u64;
        assert_eq!(required % SEGMENT_SIZE, 0, "shortfall must be segment aligned");
        alloc.grow_by(alloc.capacity(), required).unwrap();
        grown += required;
    }
}

#[test]
fn test_first_small_allocation_after_growth() {
    let mut alloc = ExternalAllocator::new();
    alloc.grow_by(0, SEGMENT_SIZE).unwrap();

    let before = alloc.allocated_bytes();
    let offset = alloc.allocate(4096).unwrap();

    assert!(offset < SEGMENT_SIZE);
    assert_eq!(alloc.allocated_bytes() - before, ExternalAllocator::good_size(4096));
}

#[test]
fn test_shortfall_then_retry_succeeds() {
    for size in [1, 100 * KB, 700 * KB, 5 * MB, SEGMENT_SIZE, 3 * SEGMENT_SIZE - 1] {
        let mut alloc = ExternalAllocator::new();

        let required = match alloc.allocate(size) {
            Err(ExtAllocError::NeedStorage { required }) => required,
            other => panic!("expected a shortfall for {} bytes, got {:?}", size, other),
        };
        assert_eq!(required, size.div_ceil(SEGMENT_SIZE) * SEGMENT_SIZE);

        alloc.grow_by(alloc.capacity(), required).unwrap();
        let offset = alloc.allocate(size).unwrap();
        assert!(offset + ExternalAllocator::good_size(size) <= alloc.capacity());
    }
}

#[test]
fn test_shortfall_is_minimal_for_spans() {
    let mut alloc = ExternalAllocator::new();
    alloc.grow_by(0, SEGMENT_SIZE).unwrap();

    // one unit is already pending, so only two more are needed
    let err = alloc.allocate(3 * SEGMENT_SIZE).unwrap_err();
    assert_eq!(err.required_storage(), Some(2 * SEGMENT_SIZE));
}

#[test]
fn test_no_shortfall_while_free_space_remains() {
    let mut alloc = ExternalAllocator::new();
    let (_, grown) = allocate_growing(&mut alloc, 64 * KB);
    assert_eq!(grown, SEGMENT_SIZE);

    // the rest of the segment serves many more SMALL blocks without growth
    for _ in 0..1000 {
        let (_, grown) = allocate_growing(&mut alloc, 64 * KB);
        assert_eq!(grown, 0);
    }
    assert_eq!(alloc.capacity(), SEGMENT_SIZE);
}

#[test]
fn test_each_page_class_claims_its_own_segment() {
    let mut alloc = ExternalAllocator::new();

    let (small, grown_small) = allocate_growing(&mut alloc, 8 * KB);
    let (medium, grown_medium) = allocate_growing(&mut alloc, 512 * KB);
    let (large, grown_large) = allocate_growing(&mut alloc, 10 * MB);

    assert_eq!(grown_small, SEGMENT_SIZE);
    assert_eq!(grown_medium, SEGMENT_SIZE);
    assert_eq!(grown_large, SEGMENT_SIZE);
    assert_eq!(small / SEGMENT_SIZE, 0);
    assert_eq!(medium / SEGMENT_SIZE, 1);
    assert_eq!(large / SEGMENT_SIZE, 2);
}

#[test]
fn test_growth_ahead_of_demand() {
    let mut alloc = ExternalAllocator::new();
    alloc.grow_by(0, 4 * SEGMENT_SIZE).unwrap();

    allocate_growing(&mut alloc, 4 * KB);
    allocate_growing(&mut alloc, 200 * KB);
    let (_, grown) = allocate_growing(&mut alloc, 2 * SEGMENT_SIZE);

    // 1 SMALL + 1 MEDIUM + 2 spanned slots fit in what was supplied
    assert_eq!(grown, 0);
    assert_eq!(alloc.stats().pending_bytes, 0);
}

#[test]
fn test_misaligned_growth_rejected() {
    let mut alloc = ExternalAllocator::new();

    assert!(matches!(
        alloc.grow_by(0, 4096),
        Err(ExtAllocError::MisalignedGrowth { .. })
    ));
    assert!(matches!(
        alloc.grow_by(4096, SEGMENT_SIZE),
        Err(ExtAllocError::MisalignedGrowth { .. })
    ));
    assert!(matches!(
        alloc.grow_by(0, 0),
        Err(ExtAllocError::MisalignedGrowth { .. })
    ));
    assert_eq!(alloc.capacity(), 0);
}

#[test]
fn test_non_contiguous_growth_rejected() {
    let mut alloc = ExternalAllocator::new();
    alloc.grow_by(0, SEGMENT_SIZE).unwrap();

    assert!(matches!(
        alloc.grow_by(2 * SEGMENT_SIZE, SEGMENT_SIZE),
        Err(ExtAllocError::NonContiguousGrowth { expected, .. }) if expected == SEGMENT_SIZE
    ));
    assert!(matches!(
        alloc.grow_by(0, SEGMENT_SIZE),
        Err(ExtAllocError::NonContiguousGrowth { .. })
    ));
    assert_eq!(alloc.capacity(), SEGMENT_SIZE);
}

#[test]
fn test_allocate_or_grow_reports_each_growth() {
    let mut alloc = ExternalAllocator::new();
    let mut medium_len = 0u64;

    for size in [4 * KB, 300 * KB, 2 * MB, SEGMENT_SIZE + 1] {
        alloc
            .allocate_or_grow(size, |offset, len| {
                assert_eq!(offset, medium_len);
                medium_len += len;
                Ok::<(), ExtAllocError>(())
            })
            .unwrap();
    }

    assert_eq!(medium_len, alloc.capacity());
    assert_eq!(alloc.capacity(), 5 * SEGMENT_SIZE);
}
