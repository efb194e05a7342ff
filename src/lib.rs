//! # extalloc - Allocator for Externally Owned Storage
//!
//! `extalloc` decides where byte ranges live inside storage it never touches:
//! a file, a raw device, a remote blob. It keeps only bookkeeping and hands
//! back offsets, borrowing mimalloc's layout:
//!
//! - **Segments** of 256MB, the unit of growth and recycling
//! - **Pages** of 1MB (SMALL) or 8MB (MEDIUM) holding equal-size blocks
//! - **LARGE** blocks as exact-fit extents, or contiguous segment runs
//!
//! Every operation returns immediately. When storage runs out, allocation
//! reports exactly how many bytes to add; the caller grows the medium and
//! retries.
//!
//! ## Quick Start
//!
//! ```rust
//! use extalloc::{ExtAllocError, ExternalAllocator, Result};
//!
//! # fn main() -> Result<()> {
//! let mut alloc = ExternalAllocator::new();
//!
//! let offset = match alloc.allocate(64 * 1024) {
//!     Ok(offset) => offset,
//!     Err(ExtAllocError::NeedStorage { required }) => {
//!         // extend the file by `required` bytes, then tell the allocator
//!         alloc.grow_by(alloc.capacity(), required)?;
//!         alloc.allocate(64 * 1024)?
//!     }
//!     Err(err) => return Err(err),
//! };
//!
//! alloc.release(offset, 64 * 1024)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Growing Automatically
//!
//! ```rust
//! use extalloc::{ExternalAllocator, Result};
//!
//! # fn main() -> Result<()> {
//! let mut alloc = ExternalAllocator::builder()
//!     .capacity_limit(4 << 30)
//!     .build()?;
//!
//! let offset = alloc.allocate_or_grow(3 << 20, |offset, len| {
//!     // file.set_len(offset + len)
//!     let _ = (offset, len);
//!     Ok::<(), extalloc::ExtAllocError>(())
//! })?;
//! assert!(alloc.is_allocated(offset));
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{allocator, config, error, shared};

pub use crate::core::{
    allocator::{
        external::ExternalAllocatorBuilder, good_size, AllocationStats, ExternalAllocator,
        PageClass, SizeClass, MAX_ALLOCATION_SIZE, SEGMENT_SIZE,
    },
    config::AllocatorConfig,
    error::{ExtAllocError, Result},
    shared::SharedAllocator,
};
