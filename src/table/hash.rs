//! Key hashing and bucket selection
//!
//! The hash is stored in the header as [`HASH_VERSION`]; every process must
//! compute the same bucket for a key, so it never depends on the platform or
//! a per-process seed.
//!
//! [`HASH_VERSION`]: crate::layout::HASH_VERSION

/// Hash of a key (CRC-32, IEEE polynomial)
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Bucket of a hash in a table of `bucket_count` buckets (a power of two)
pub fn bucket_index(hash: u32, bucket_count: u64) -> u64 {
    debug_assert!(bucket_count.is_power_of_two());
    u64::from(hash) & (bucket_count - 1)
}

/// Checksum over the key and value bytes of a record
pub fn record_checksum(key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}
