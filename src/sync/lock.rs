//! Inter-process pool lock living in the pool header
//!
//! The lock word packs a state and the holder's pid: `state << 32 | pid`.
//! It moves `FREE -> HELD(pid) -> FREE` in normal operation. A waiter that
//! outlasts the timeout and finds the holder dead moves it to
//! `RECOVERING(me)`, repairs the pool and then takes it as `HELD(me)`.

use std::{
    mem,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant, SystemTime},
};

use log::{debug, warn};

use crate::{
    error::{PoolError, Result},
    layout::HeaderRef,
};

use super::{
    fault::{checkpoint, FaultInjector, FaultPoint},
    liveness::{current_pid, ProcessProbe},
};

const STATE_FREE: u32 = 0;
const STATE_HELD: u32 = 1;
const STATE_RECOVERING: u32 = 2;

/// Busy-wait iterations before the first sleep
const SPIN_LIMIT: u32 = 64;
/// First and largest sleep between attempts
const MIN_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(5);

/// Decoded lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(u32),
    Recovering(u32),
    /// Garbage in the state half of the word
    Unknown(u64),
}

impl LockState {
    pub fn encode(self) -> u64 {
        match self {
            LockState::Free => 0,
            LockState::Held(pid) => (u64::from(STATE_HELD) << 32) | u64::from(pid),
            LockState::Recovering(pid) => (u64::from(STATE_RECOVERING) << 32) | u64::from(pid),
            LockState::Unknown(word) => word,
        }
    }

    pub fn decode(word: u64) -> Self {
        let pid = word as u32;
        match (word >> 32) as u32 {
            STATE_FREE if pid == 0 => LockState::Free,
            STATE_HELD => LockState::Held(pid),
            STATE_RECOVERING => LockState::Recovering(pid),
            _ => LockState::Unknown(word),
        }
    }

    /// Pid recorded in the word, if any
    pub fn holder(self) -> Option<u32> {
        match self {
            LockState::Held(pid) | LockState::Recovering(pid) => Some(pid),
            _ => None,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How an acquisition ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The lock was free or released in time
    Normal,
    /// The lock was reclaimed from a dead holder and the pool repaired
    Recovered { from: u32 },
}

/// Handle on the lock word of one mapped pool
#[derive(Debug, Clone, Copy)]
pub struct PoolLock<'r> {
    word: &'r AtomicU64,
    since: &'r AtomicU64,
    header: HeaderRef<'r>,
    timeout: Duration,
    probe: &'r dyn ProcessProbe,
    pid: u32,
}

impl<'r> PoolLock<'r> {
    pub fn new(header: HeaderRef<'r>, timeout: Duration, probe: &'r dyn ProcessProbe) -> Self {
        Self {
            word: header.lock_word(),
            since: header.lock_since(),
            header,
            timeout,
            probe,
            pid: current_pid(),
        }
    }

    /// Current state of the lock word
    pub fn state(&self) -> LockState {
        LockState::decode(self.word.load(Ordering::Acquire))
    }

    /// Milliseconds since the epoch at which the lock was last taken
    pub fn held_since_ms(&self) -> u64 {
        self.since.load(Ordering::Relaxed)
    }

    /// Take the lock if it is free right now
    pub fn try_acquire(&self) -> bool {
        let ok = self
            .word
            .compare_exchange(
                LockState::Free.encode(),
                LockState::Held(self.pid).encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if ok {
            self.since.store(now_ms(), Ordering::Relaxed);
        }
        ok
    }

    /// Acquire the lock, reclaiming it from a dead holder if needed
    ///
    /// `repair` runs while the lock is in the recovering state. A repair that
    /// fails releases the lock and surfaces as `RecoveryFailed`; one that is
    /// abandoned by a fault injector keeps it.
    pub fn acquire(&self, repair: impl FnOnce() -> Result<()>) -> Result<(LockGuard<'r>, Acquired)> {
        let started = Instant::now();
        let mut deadline = started + self.timeout;
        let mut spins = 0u32;
        let mut backoff = MIN_BACKOFF;

        loop {
            if self.try_acquire() {
                return Ok((self.guard(), Acquired::Normal));
            }

            let now = Instant::now();
            if now < deadline {
                if spins < SPIN_LIMIT {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                continue;
            }

            let observed = self.word.load(Ordering::Acquire);
            let state = LockState::decode(observed);
            if state == LockState::Free {
                continue;
            }
            let holder = state.holder().unwrap_or(0);
            if holder != 0 && self.probe.is_alive(holder) {
                return Err(PoolError::lock_timeout(
                    holder,
                    started.elapsed().as_millis() as u64,
                ));
            }

            let claimed = self.word.compare_exchange(
                observed,
                LockState::Recovering(self.pid).encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_err() {
                // Someone else moved the lock; wait for it again
                deadline = Instant::now() + self.timeout;
                spins = 0;
                backoff = MIN_BACKOFF;
                continue;
            }

            warn!(
                "reclaiming pool lock from dead process {} ({:?})",
                holder, state
            );
            self.since.store(now_ms(), Ordering::Relaxed);
            return self.recover(holder, repair);
        }
    }

    fn recover(&self, holder: u32, repair: impl FnOnce() -> Result<()>) -> Result<(LockGuard<'r>, Acquired)> {
        match repair() {
            Ok(()) => {
                self.header.set_recoveries(self.header.recoveries() + 1);
                self.word
                    .store(LockState::Held(self.pid).encode(), Ordering::Release);
                warn!("pool recovered after death of process {}", holder);
                Ok((self.guard(), Acquired::Recovered { from: holder }))
            }
            Err(e) if e.is_abandoned() => Err(e),
            Err(e) => {
                self.word.store(LockState::Free.encode(), Ordering::Release);
                Err(match e {
                    PoolError::RecoveryFailed { .. } => e,
                    other => PoolError::recovery_failed(other.to_string()),
                })
            }
        }
    }

    fn guard(&self) -> LockGuard<'r> {
        LockGuard {
            word: self.word,
            pid: self.pid,
        }
    }

    /// Run `op` under the lock
    ///
    /// An operation ending in [`PoolError::Abandoned`] keeps the lock held,
    /// as a crashed process would.
    pub fn with_lock<T>(
        &self,
        faults: &dyn FaultInjector,
        repair: impl FnOnce() -> Result<()>,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let (guard, acquired) = self.acquire(|| {
            checkpoint(faults, FaultPoint::RecoveryStarted)?;
            repair()
        })?;
        if let Acquired::Recovered { from } = acquired {
            debug!("lock acquired after recovering from pid {}", from);
        }

        let result = checkpoint(faults, FaultPoint::LockAcquired).and_then(|()| op());
        match result {
            Err(e) if e.is_abandoned() => {
                guard.abandon();
                Err(e)
            }
            other => other,
        }
    }

    /// Clear the lock word whoever holds it
    pub fn force_release(&self) {
        self.word.store(LockState::Free.encode(), Ordering::Release);
    }
}

/// Scoped ownership of the pool lock; releases it on drop
#[derive(Debug)]
pub struct LockGuard<'r> {
    word: &'r AtomicU64,
    pid: u32,
}

impl LockGuard<'_> {
    /// Give up the guard without releasing the lock
    pub fn abandon(self) {
        mem::forget(self);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let released = self.word.compare_exchange(
            LockState::Held(self.pid).encode(),
            LockState::Free.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(actual) = released {
            warn!(
                "pool lock was not held by {} on release: {:?}",
                self.pid,
                LockState::decode(actual)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::PoolHeader,
        memory::{MappedRegion, RegionConfig, RegionInitializer},
        sync::{
            fault::{AbandonAt, NoFaults},
            liveness::{AssumeAlive, AssumeDead, OsProbe},
        },
    };
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    struct ZeroHeader;

    impl RegionInitializer for ZeroHeader {
        fn is_initialized(&self, _region: &MappedRegion) -> bool {
            false
        }

        fn initialize(&self, _region: &MappedRegion) -> Result<()> {
            Ok(())
        }
    }

    fn region(dir: &TempDir) -> MappedRegion {
        let config = RegionConfig::new(dir.path().join("lock"), PoolHeader::HEAP_START + 4096);
        MappedRegion::create(&config, &ZeroHeader).unwrap()
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_state_encoding() {
        for state in [LockState::Free, LockState::Held(42), LockState::Recovering(7)] {
            assert_eq!(LockState::decode(state.encode()), state);
        }
        assert_eq!(LockState::Held(42).holder(), Some(42));
        assert!(matches!(LockState::decode(9 << 32), LockState::Unknown(_)));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let region = region(&dir);
        let lock = PoolLock::new(HeaderRef::new(&region).unwrap(), SHORT, &OsProbe);

        {
            let (_guard, acquired) = lock.acquire(|| Ok(())).unwrap();
            assert_eq!(acquired, Acquired::Normal);
            assert_eq!(lock.state(), LockState::Held(current_pid()));
            assert!(lock.held_since_ms() > 0);
        }
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn test_live_holder_times_out() {
        let dir = TempDir::new().unwrap();
        let region = region(&dir);
        let lock = PoolLock::new(HeaderRef::new(&region).unwrap(), SHORT, &AssumeAlive);

        let (guard, _) = lock.acquire(|| Ok(())).unwrap();
        let started = Instant::now();
        let err = lock.acquire(|| Ok(())).unwrap_err();
        assert!(matches!(err, PoolError::LockTimeout { .. }));
        assert!(started.elapsed() >= SHORT);
        drop(guard);
    }

    #[test]
    fn test_dead_holder_is_recovered() {
        let dir = TempDir::new().unwrap();
        let region = region(&dir);
        let header = HeaderRef::new(&region).unwrap();
        header.lock_word().store(LockState::Held(999_999).encode(), Ordering::SeqCst);

        let lock = PoolLock::new(header, SHORT, &AssumeDead);
        let repaired = AtomicBool::new(false);
        let (guard, acquired) = lock
            .acquire(|| {
                assert_eq!(lock.state(), LockState::Recovering(current_pid()));
                repaired.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(acquired, Acquired::Recovered { from: 999_999 });
        assert!(repaired.load(Ordering::SeqCst));
        assert_eq!(header.recoveries(), 1);
        drop(guard);
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn test_failed_repair_releases_lock() {
        let dir = TempDir::new().unwrap();
        let region = region(&dir);
        let header = HeaderRef::new(&region).unwrap();
        header.lock_word().store(LockState::Held(999_999).encode(), Ordering::SeqCst);

        let lock = PoolLock::new(header, SHORT, &AssumeDead);
        let err = lock
            .acquire(|| Err(PoolError::consistency("bad header")))
            .unwrap_err();
        assert!(matches!(err, PoolError::RecoveryFailed { .. }));
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn test_abandoned_operation_keeps_lock() {
        let dir = TempDir::new().unwrap();
        let region = region(&dir);
        let lock = PoolLock::new(HeaderRef::new(&region).unwrap(), SHORT, &OsProbe);

        let injector = AbandonAt(FaultPoint::LockAcquired);
        let err = lock.with_lock(&injector, || Ok(()), || Ok(())).unwrap_err();
        assert!(err.is_abandoned());
        assert_eq!(lock.state(), LockState::Held(current_pid()));

        lock.force_release();
        let value = lock.with_lock(&NoFaults, || Ok(()), || Ok(5)).unwrap();
        assert_eq!(value, 5);
        assert_eq!(lock.state(), LockState::Free);
    }
}
