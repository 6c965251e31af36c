//! Header structures stored inside the pool region

use std::{
    mem::size_of,
    sync::atomic::AtomicU64,
    time::SystemTime,
};

use crate::error::{PoolError, Result};
use super::constants::*;

/// Global header at offset 0 of every pool file
#[repr(C)]
pub struct PoolHeader {
    /// Magic number, written last when a pool is initialized
    pub magic: u64,
    /// Layout version
    pub layout_version: u32,
    /// Key hash version
    pub hash_version: u32,
    /// Total region size in bytes, immutable after creation
    pub total_size: u64,
    /// Allocator granularity in bytes
    pub granularity: u64,
    /// Offset of the first heap block
    pub heap_start: u64,
    /// Offset one past the last heap block
    pub heap_end: u64,
    /// Lock word: `state << 32 | pid`
    pub lock: AtomicU64,
    /// Milliseconds since the epoch at which the lock was taken
    pub lock_since: AtomicU64,
    /// Payload offset of the current bucket table (0 = none)
    pub table: u64,
    /// Payload offset of a table being built by a resize (0 = none)
    pub pending_table: u64,
    /// Number of live records
    pub entry_count: u64,
    /// Next record sequence number
    pub next_seq: u64,
    /// Sum of all free block sizes
    pub free_bytes: u64,
    /// Number of free blocks
    pub free_chunks: u64,
    /// Number of completed crash recoveries
    pub recoveries: u64,
    /// Creation timestamp (Unix epoch seconds)
    pub created_at: u64,
    /// Heads of the per-size-class free lists (block offsets, 0 = empty)
    pub free_lists: [u64; NUM_SIZE_CLASSES],
}

impl PoolHeader {
    /// Size of the header in bytes
    pub const SIZE: u64 = size_of::<PoolHeader>() as u64;

    /// Offset of the first heap block
    pub const HEAP_START: u64 = align_up(Self::SIZE, CACHE_LINE_SIZE as u64);

    /// Initialize every field except `magic` for a region of `total_size` bytes
    ///
    /// The caller stores [`POOL_MAGIC`] once the heap and table are in place.
    pub fn initialize(&mut self, total_size: u64, granularity: u64) {
        let heap_start = Self::HEAP_START;
        let heap_len = total_size.saturating_sub(heap_start) / granularity * granularity;

        self.magic = 0;
        self.layout_version = LAYOUT_VERSION;
        self.hash_version = HASH_VERSION;
        self.total_size = total_size;
        self.granularity = granularity;
        self.heap_start = heap_start;
        self.heap_end = heap_start + heap_len;
        self.lock = AtomicU64::new(0);
        self.lock_since = AtomicU64::new(0);
        self.table = 0;
        self.pending_table = 0;
        self.entry_count = 0;
        self.next_seq = 1;
        self.free_bytes = 0;
        self.free_chunks = 0;
        self.recoveries = 0;
        self.created_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.free_lists = [0; NUM_SIZE_CLASSES];
    }

    /// Validate magic, versions and geometry against the mapped length
    pub fn validate(&self, mapped_len: u64) -> Result<()> {
        if self.magic != POOL_MAGIC {
            return Err(PoolError::consistency("Invalid pool header magic number"));
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err(PoolError::consistency(format!(
                "Unsupported layout version: {}",
                self.layout_version
            )));
        }
        if self.hash_version != HASH_VERSION {
            return Err(PoolError::consistency(format!(
                "Unsupported hash version: {}",
                self.hash_version
            )));
        }
        if self.total_size > mapped_len {
            return Err(PoolError::consistency(format!(
                "Header size {} exceeds file size {}",
                self.total_size, mapped_len
            )));
        }
        let g = self.granularity;
        if g < MIN_GRANULARITY || g > MAX_GRANULARITY || g % GRANULARITY_ALIGN != 0 {
            return Err(PoolError::consistency(format!("Invalid granularity: {}", g)));
        }
        if self.heap_start != Self::HEAP_START
            || self.heap_end < self.heap_start + g
            || self.heap_end > self.total_size
            || (self.heap_end - self.heap_start) % g != 0
        {
            return Err(PoolError::consistency("Heap bounds out of range"));
        }
        Ok(())
    }

    /// Size of the heap in bytes
    pub fn heap_len(&self) -> u64 {
        self.heap_end - self.heap_start
    }
}

/// Kind of a used heap block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Key/value record
    Record,
    /// Bucket table
    Table,
}

impl BlockKind {
    /// Flag bits for this kind
    pub fn bits(self) -> u64 {
        match self {
            BlockKind::Record => BLOCK_KIND_RECORD,
            BlockKind::Table => BLOCK_KIND_TABLE,
        }
    }

    /// Decode kind bits
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits & BLOCK_KIND_MASK {
            BLOCK_KIND_RECORD => Some(BlockKind::Record),
            BLOCK_KIND_TABLE => Some(BlockKind::Table),
            _ => None,
        }
    }
}

/// Header in front of every heap block (boundary tag)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Block size in bytes with flag bits in the low nibble
    pub size_flags: u64,
    /// Size of the physically preceding block (0 for the first block)
    pub prev_size: u64,
}

impl BlockHeader {
    /// Header of a free block
    pub fn free(size: u64, prev_size: u64) -> Self {
        Self {
            size_flags: size,
            prev_size,
        }
    }

    /// Header of a used block of the given kind
    pub fn used(size: u64, prev_size: u64, kind: BlockKind) -> Self {
        Self {
            size_flags: size | BLOCK_USED | kind.bits(),
            prev_size,
        }
    }

    /// Block size in bytes
    pub fn size(&self) -> u64 {
        self.size_flags & !BLOCK_FLAG_MASK
    }

    /// Whether the block is in use
    pub fn is_used(&self) -> bool {
        self.size_flags & BLOCK_USED != 0
    }

    /// Kind of a used block
    pub fn kind(&self) -> Option<BlockKind> {
        if self.is_used() {
            BlockKind::from_bits(self.size_flags)
        } else {
            None
        }
    }
}

/// Free-list links stored right after the header of a free block
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeLinks {
    /// Next free block offset in the same size class (0 = end)
    pub next: u64,
    /// Previous free block offset in the same size class (0 = list head)
    pub prev: u64,
}

/// Header at the start of a record payload, followed by key then value bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordHeader {
    /// Payload offset of the next record in the bucket chain (0 = end)
    pub next: u64,
    /// Monotonic write sequence, newest wins during recovery
    pub seq: u64,
    /// Value length in bytes
    pub value_len: u64,
    /// Key length in bytes
    pub key_len: u32,
    /// Hash of the key
    pub key_hash: u32,
    /// CRC-32 over key and value bytes
    pub checksum: u32,
    /// Record state, written last
    pub state: u32,
}

impl RecordHeader {
    /// Size of the record header in bytes
    pub const SIZE: u64 = size_of::<RecordHeader>() as u64;

    /// Total payload length for a key and value
    pub fn payload_len(key_len: u64, value_len: u64) -> u64 {
        Self::SIZE + key_len + value_len
    }
}

/// Header at the start of a bucket table payload, followed by the slots
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TableHeader {
    /// Number of buckets (power of two)
    pub bucket_count: u64,
    /// Reserved, zero
    pub reserved: u64,
}

impl TableHeader {
    /// Payload length of a table with `bucket_count` buckets
    pub fn payload_len(bucket_count: u64) -> u64 {
        TABLE_HEADER_SIZE + bucket_count * 8
    }
}
