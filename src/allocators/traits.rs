//! Allocator trait definition

use serde::{Deserialize, Serialize};

use crate::{error::Result, layout::BlockKind};

/// Snapshot of allocator occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStatus {
    /// Total size of the region in bytes
    pub total_bytes: u64,
    /// Sum of all free block sizes
    pub free_bytes: u64,
    /// Number of free blocks
    pub free_chunks: u64,
    /// Size of the largest free block
    pub largest_chunk: u64,
}

impl AllocatorStatus {
    /// Bytes not free (live blocks plus fixed overhead)
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes - self.free_bytes
    }
}

/// Trait for allocators handing out region-relative offsets
///
/// Offsets stay valid in every process that maps the region, whatever base
/// address the mapping got.
pub trait Allocator {
    /// Allocate a block whose payload holds at least `size` bytes; returns the
    /// payload offset
    fn allocate(&self, size: u64, kind: BlockKind) -> Result<u64>;

    /// Return a block by its payload offset
    fn free(&self, offset: u64) -> Result<()>;

    /// Current occupancy
    fn status(&self) -> Result<AllocatorStatus>;

    /// Drop every allocation and start over with one free block
    fn reset(&self) -> Result<()>;

    /// Usable payload bytes of the block at `offset`
    fn capacity(&self, offset: u64) -> Result<u64>;

    /// Allocation granularity in bytes
    fn granularity(&self) -> u64;
}

/// Common allocator operations
pub trait AllocatorExt: Allocator {
    /// Allocate and zero the requested payload bytes
    fn allocate_zeroed(&self, size: u64, kind: BlockKind) -> Result<u64>;

    /// Get utilization (0.0 to 1.0)
    fn utilization(&self) -> Result<f64> {
        let status = self.status()?;
        if status.total_bytes == 0 {
            return Ok(0.0);
        }
        Ok(status.used_bytes() as f64 / status.total_bytes as f64)
    }
}
