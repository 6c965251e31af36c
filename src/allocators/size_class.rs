//! Size class mapping for the free-list allocator

use crate::layout::{round_up, BLOCK_HEADER_SIZE, NUM_SIZE_CLASSES};

/// Index of the open-ended class holding every larger block
pub const LAST_CLASS: usize = NUM_SIZE_CLASSES - 1;

/// Maps block sizes to free-list classes
///
/// Class `k < LAST_CLASS` holds blocks of exactly `(k + 1) * granularity`
/// bytes; the last class holds everything larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    granularity: u64,
}

impl SizeClasses {
    /// Create the mapping for a granularity
    pub fn new(granularity: u64) -> Self {
        Self { granularity }
    }

    /// Allocation granularity
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Class of a block of `block_size` bytes
    pub fn class_of(&self, block_size: u64) -> usize {
        let units = (block_size / self.granularity).max(1);
        ((units - 1) as usize).min(LAST_CLASS)
    }

    /// Block size held by an exact class, `None` for the open-ended class
    pub fn class_size(&self, class: usize) -> Option<u64> {
        if class < LAST_CLASS {
            Some((class as u64 + 1) * self.granularity)
        } else {
            None
        }
    }

    /// Block size needed for a payload of `request` bytes, header included
    pub fn block_size_for(&self, request: u64) -> Option<u64> {
        let raw = request.checked_add(BLOCK_HEADER_SIZE)?;
        if raw > u64::MAX - self.granularity {
            return None;
        }
        Some(round_up(raw, self.granularity).max(self.granularity))
    }
}
