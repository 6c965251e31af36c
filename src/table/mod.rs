//! Key to record index kept inside the pool heap

pub mod buckets;
pub mod hash;
pub mod record;

pub use buckets::HashTable;
pub use hash::{bucket_index, key_hash, record_checksum};
pub use record::{RecordRef, RecordState};
