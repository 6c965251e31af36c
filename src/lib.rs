//! # shmkv - Crash-Safe Shared Memory Key-Value Pools
//!
//! shmkv stores byte-string keys and values in a memory-mapped file that any
//! number of processes on one host can open at the same time. A process that
//! dies in the middle of an operation never corrupts the pool: the next
//! process to need the lock notices the dead holder, repairs the pool and
//! carries on.
//!
//! ## Features
//!
//! - **Namespaced pools**: short names resolved under a shared root directory
//! - **Relocatable layout**: everything inside the file is an offset
//! - **Segregated free-list allocator**: 64 size classes, coalescing on free
//! - **Chained hash table**: CRC-32 keyed, grows at 3/4 load
//! - **Crash recovery**: dead lock holders detected with `kill(pid, 0)`
//! - **Fault injection**: named fault points for crash testing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 Pool (handle)                   │
//! ├─────────────────────────────────────────────────┤
//! │  PoolLock + recovery    │  HashTable            │
//! │  - FREE/HELD/RECOVERING │  - bucket array       │
//! │  - verify / repair      │  - record chains      │
//! ├─────────────────────────────────────────────────┤
//! │            FreeListAllocator (heap)             │
//! ├─────────────────────────────────────────────────┤
//! │      MappedRegion (file, flock, memmap2)        │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shmkv::{Pool, PoolOptions};
//!
//! let pool = Pool::create_or_open(PoolOptions::namespace("sessions").with_size_mb(64.0))?;
//! pool.set(b"user:1", b"alice")?;
//! assert_eq!(pool.get(b"user:1")?, Some(b"alice".to_vec()));
//! # Ok::<(), shmkv::PoolError>(())
//! ```

// Core modules
pub mod error;
pub mod layout;
pub mod memory;
pub mod allocators;
pub mod table;

// Locking and crash recovery
pub mod sync;

// Public engine
pub mod pool;

// Main API re-exports
pub use error::{PoolError, Result};
pub use pool::{Pool, PoolOptions, PoolStatus};
pub use memory::{PoolIdentifier, MappedRegion, RegionConfig};
pub use allocators::{Allocator, AllocatorExt, AllocatorStatus, FreeListAllocator};
pub use table::HashTable;
pub use sync::{
    fault::{AbandonAt, FaultAction, FaultInjector, FaultPoint, NoFaults},
    liveness::{AssumeAlive, AssumeDead, OsProbe, ProcessProbe},
    lock::{LockState, PoolLock},
    recovery::{ConsistencyReport, RepairSummary},
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Default pool size in MiB
    pub const DEFAULT_SIZE_MB: f64 = 1024.0;

    /// Default minimum allocation size in bytes
    pub const DEFAULT_MIN_ALLOC_SIZE: u64 = 64;

    /// Default wait on the pool lock before probing the holder
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

    /// Smallest accepted pool size
    pub const MIN_POOL_SIZE: u64 = 64 * 1024;

    /// Pool sizes are rounded up to this
    pub const PAGE_SIZE: u64 = 4096;
}
