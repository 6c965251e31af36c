//! Fault points for crash testing
//!
//! An injector is handed to a pool through its options and consulted at
//! named steps of every mutating operation. Abandoning at a step stops the
//! operation right there, keeping the lock held and the region exactly as a
//! process dying at that instruction would leave it.

use std::fmt;

use crate::error::{PoolError, Result};

/// Named step inside a pool operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// The pool lock was just taken
    LockAcquired,
    /// A dead holder's lock was reclaimed and repair is about to run
    RecoveryStarted,
    /// A record block was allocated but nothing was written into it
    RecordAllocated,
    /// A record was written and committed but is not yet linked
    RecordWritten,
    /// A record was linked into its bucket; the old version is still live
    RecordPublished,
    /// A record was unlinked from its bucket but not yet freed
    RecordUnlinked,
    /// A larger table is pending and records are being relinked
    ResizeInProgress,
    /// The table was detached by a clear
    ClearStarted,
}

impl FaultPoint {
    /// Every fault point, in operation order
    pub const ALL: [FaultPoint; 8] = [
        FaultPoint::LockAcquired,
        FaultPoint::RecoveryStarted,
        FaultPoint::RecordAllocated,
        FaultPoint::RecordWritten,
        FaultPoint::RecordPublished,
        FaultPoint::RecordUnlinked,
        FaultPoint::ResizeInProgress,
        FaultPoint::ClearStarted,
    ];
}

/// Injector answer at a fault point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Carry on with the operation
    Continue,
    /// Stop the operation here and leave the lock held
    Abandon,
}

/// Decides what happens at each fault point
pub trait FaultInjector: Send + Sync + fmt::Debug {
    /// Called when an operation reaches `point`
    fn at(&self, point: FaultPoint) -> FaultAction;
}

/// Injector that never interferes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn at(&self, _point: FaultPoint) -> FaultAction {
        FaultAction::Continue
    }
}

/// Injector that abandons every operation reaching one fault point
#[derive(Debug, Clone, Copy)]
pub struct AbandonAt(pub FaultPoint);

impl FaultInjector for AbandonAt {
    fn at(&self, point: FaultPoint) -> FaultAction {
        if point == self.0 {
            FaultAction::Abandon
        } else {
            FaultAction::Continue
        }
    }
}

/// Consult the injector, turning `Abandon` into [`PoolError::Abandoned`]
pub fn checkpoint(injector: &dyn FaultInjector, point: FaultPoint) -> Result<()> {
    match injector.at(point) {
        FaultAction::Continue => Ok(()),
        FaultAction::Abandon => Err(PoolError::abandoned(point)),
    }
}
