//! Pool occupancy report

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::allocators::AllocatorStatus;

/// Memory usage of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Size of the pool file in bytes
    pub total_bytes: u64,
    /// `total_bytes - free_bytes`, header and slack included
    pub used_bytes: u64,
    /// Sum of all free block sizes
    pub free_bytes: u64,
    /// Number of free blocks
    pub free_chunks: u64,
    /// Largest single allocation that can currently succeed, header included
    pub largest_chunk: u64,
}

impl From<AllocatorStatus> for PoolStatus {
    fn from(status: AllocatorStatus) -> Self {
        Self {
            total_bytes: status.total_bytes,
            used_bytes: status.used_bytes(),
            free_bytes: status.free_bytes,
            free_chunks: status.free_chunks,
            largest_chunk: status.largest_chunk,
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total_bytes:   {}", self.total_bytes)?;
        writeln!(f, "used_bytes:    {}", self.used_bytes)?;
        writeln!(f, "free_bytes:    {}", self.free_bytes)?;
        writeln!(f, "free_chunks:   {}", self.free_chunks)?;
        write!(f, "largest_chunk: {}", self.largest_chunk)
    }
}
