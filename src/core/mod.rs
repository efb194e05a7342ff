//! Allocator internals: layout bookkeeping, configuration, errors and the
//! lock-protected handle.

pub mod allocator;
pub mod config;
pub mod error;
pub mod shared;
