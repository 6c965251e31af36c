//! Inter-process locking, crash detection and recovery
//!
//! All processes mapping a pool serialize on one lock word in its header.
//! A process that dies while holding it leaves the word behind; the next
//! process to time out on it checks whether the holder still exists,
//! reclaims the lock if not, and repairs the pool before going on.
//!
//! Key pieces:
//! - [`PoolLock`] and its scoped [`LockGuard`]
//! - [`ProcessProbe`] liveness checks, backed by `kill(pid, 0)` by default
//! - [`verify`] and [`repair`] over the region structures
//! - [`FaultInjector`] hooks for crash testing

pub mod fault;
pub mod liveness;
pub mod lock;
pub mod recovery;

pub use fault::{checkpoint, AbandonAt, FaultAction, FaultInjector, FaultPoint, NoFaults};
pub use liveness::{current_pid, AssumeAlive, AssumeDead, OsProbe, ProcessProbe};
pub use lock::{Acquired, LockGuard, LockState, PoolLock};
pub use recovery::{repair, verify, ConsistencyReport, RepairSummary};
