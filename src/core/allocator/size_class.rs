//! Size classes
//!
//! Maps a request to a bin, an exact block size and a page class.
//! SMALL bins step by 4KB up to 64KB, then by 8KB/16KB up to 128KB.
//! MEDIUM bins use four classes per doubling up to 1MB, which keeps the
//! internal waste of any request above 64KB under 25%.

use super::{PageClass, BLOCK_ALIGNMENT, LARGE_BIN, MEDIUM_MAX_SIZE, SMALL_MAX_SIZE};

const KB: u64 = 1024;

/// Block size of every bin below `LARGE_BIN`
pub const BIN_SIZES: [u64; LARGE_BIN] = [
    // SMALL
    4 * KB,
    8 * KB,
    12 * KB,
    16 * KB,
    20 * KB,
    24 * KB,
    28 * KB,
    32 * KB,
    36 * KB,
    40 * KB,
    44 * KB,
    48 * KB,
    52 * KB,
    56 * KB,
    60 * KB,
    64 * KB,
    72 * KB,
    80 * KB,
    88 * KB,
    96 * KB,
    112 * KB,
    128 * KB,
    // MEDIUM
    160 * KB,
    192 * KB,
    224 * KB,
    256 * KB,
    320 * KB,
    384 * KB,
    448 * KB,
    512 * KB,
    640 * KB,
    768 * KB,
    896 * KB,
    1024 * KB,
];

/// Classification of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub bin: usize,
    pub block_size: u64,
    pub page_class: PageClass,
}

impl SizeClass {
    /// Classify a request. Zero is treated as the smallest request.
    pub fn of(size: u64) -> Self {
        if size > MEDIUM_MAX_SIZE {
            return SizeClass {
                bin: LARGE_BIN,
                block_size: round_to_alignment(size),
                page_class: PageClass::Large,
            };
        }

        let bin = BIN_SIZES.partition_point(|&block| block < size);
        let block_size = BIN_SIZES[bin];
        let page_class = if block_size <= SMALL_MAX_SIZE {
            PageClass::Small
        } else {
            PageClass::Medium
        };

        SizeClass {
            bin,
            block_size,
            page_class,
        }
    }
}

/// Size of the block `allocate(size)` would hand out. Never less than `size`.
pub fn good_size(size: u64) -> u64 {
    SizeClass::of(size).block_size
}

fn round_to_alignment(size: u64) -> u64 {
    size.checked_next_multiple_of(BLOCK_ALIGNMENT).unwrap_or(size)
}
