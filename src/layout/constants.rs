//! Constants describing the persisted pool format

/// Cache line size used to align the start of the heap
pub const CACHE_LINE_SIZE: usize = 64;

/// Magic number identifying an initialized pool header ("SHMKVPOL")
pub const POOL_MAGIC: u64 = 0x53484D4B56504F4C;

/// Current layout version
pub const LAYOUT_VERSION: u32 = 1;

/// Version of the key hash stored in the header (1 = CRC-32/IEEE)
pub const HASH_VERSION: u32 = 1;

/// Number of allocator size classes
pub const NUM_SIZE_CLASSES: usize = 64;

/// Size of the header in front of every heap block
pub const BLOCK_HEADER_SIZE: u64 = 16;

/// Smallest allowed allocation granularity (header plus free links)
pub const MIN_GRANULARITY: u64 = 32;

/// Largest allowed allocation granularity
pub const MAX_GRANULARITY: u64 = 1024 * 1024;

/// Granularities are rounded up to this alignment
pub const GRANULARITY_ALIGN: u64 = 16;

/// Bucket count of a freshly created table
pub const INITIAL_BUCKETS: u64 = 512;

/// Tables grow once entries exceed buckets * NUM / DEN
pub const LOAD_FACTOR_NUM: u64 = 3;
pub const LOAD_FACTOR_DEN: u64 = 4;

/// Record state: fully written and visible
pub const RECORD_COMMITTED: u32 = 0x434D_5444; // "CMTD"

/// Record state: delete in progress, never resurrected by recovery
pub const RECORD_DELETED: u32 = 0x4445_4C44; // "DELD"

/// Block flag: block is in use
pub const BLOCK_USED: u64 = 0b0001;

/// Block flag bits holding the block kind
pub const BLOCK_KIND_MASK: u64 = 0b0110;

/// Kind bits of a record block
pub const BLOCK_KIND_RECORD: u64 = 0b0010;

/// Kind bits of a bucket table block
pub const BLOCK_KIND_TABLE: u64 = 0b0100;

/// All flag bits kept in the low bits of a block size
pub const BLOCK_FLAG_MASK: u64 = 0b1111;

/// Size of the table header in front of the bucket slots
pub const TABLE_HEADER_SIZE: u64 = 16;

/// Round `value` up to a multiple of `align` (power of two)
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Round `value` up to a multiple of `unit` (any non-zero unit)
pub const fn round_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

/// Effective allocator granularity for a requested minimum allocation size
pub fn granularity_for(min_alloc_size: u64) -> u64 {
    align_up(min_alloc_size.max(MIN_GRANULARITY), GRANULARITY_ALIGN).min(MAX_GRANULARITY)
}
