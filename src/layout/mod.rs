//! On-region layout of a pool file
//!
//! A pool file is one contiguous region:
//! 1. Pool header (magic, versions, geometry, lock word, table offset,
//!    allocator counters and free-list heads)
//! 2. Heap of blocks, each starting with a [`BlockHeader`]
//!
//! Every reference stored in the region is a `u64` offset from the region
//! base, so each process may map the file at its own address.

pub mod constants;
pub mod headers;
pub mod view;

pub use constants::*;
pub use headers::{BlockHeader, BlockKind, FreeLinks, PoolHeader, RecordHeader, TableHeader};
pub use view::HeaderRef;
