//! Crash recovery through the public API
//!
//! A handle built with `AbandonAt` stops at a fault point and leaves the pool
//! lock held, exactly as a killed process would. A second handle whose probe
//! reports the holder dead then has to recover the pool.

use std::{sync::Arc, time::Duration};

use shmkv::{AbandonAt, AssumeAlive, AssumeDead, FaultPoint, OsProbe, Pool, PoolError, PoolOptions};
use tempfile::TempDir;

fn options(temp_dir: &TempDir) -> PoolOptions {
    PoolOptions::namespace("recovery")
        .with_namespace_root(temp_dir.path())
        .with_size_mb(2.0)
}

fn crashing(temp_dir: &TempDir, point: FaultPoint) -> Pool {
    Pool::create_or_open(
        options(temp_dir)
            .with_fault_injector(Arc::new(AbandonAt(point)))
            .with_lock_timeout(Duration::from_millis(50)),
    )
    .unwrap()
}

fn survivor(temp_dir: &TempDir) -> Pool {
    Pool::open(
        options(temp_dir)
            .with_process_probe(Arc::new(AssumeDead))
            .with_lock_timeout(Duration::from_millis(50)),
    )
    .unwrap()
}

fn seed(temp_dir: &TempDir, entries: usize) {
    let pool = Pool::create_or_open(options(temp_dir)).unwrap();
    for i in 0..entries {
        pool.set(format!("seed-{i}").as_bytes(), format!("{i}").as_bytes())
            .unwrap();
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;

    #[test]
    fn test_crash_before_commit_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 10);

        let pool = crashing(&temp_dir, FaultPoint::RecordAllocated);
        assert!(pool.set(b"lost", b"value").unwrap_err().is_abandoned());

        let pool = survivor(&temp_dir);
        assert_eq!(pool.get(b"lost").unwrap(), None);
        assert_eq!(pool.size().unwrap(), 10);
        assert_eq!(pool.recoveries().unwrap(), 1);
        assert!(pool.check_consistency().unwrap());
    }

    #[test]
    fn test_crash_after_commit_completes_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 10);

        let pool = crashing(&temp_dir, FaultPoint::RecordWritten);
        assert!(pool.set(b"seed-3", b"replaced").unwrap_err().is_abandoned());

        let pool = survivor(&temp_dir);
        assert_eq!(pool.get(b"seed-3").unwrap(), Some(b"replaced".to_vec()));
        assert_eq!(pool.size().unwrap(), 10);
        assert!(pool.check_consistency().unwrap());
    }

    #[test]
    fn test_crash_during_delete_never_resurrects() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 10);

        let pool = crashing(&temp_dir, FaultPoint::RecordUnlinked);
        assert!(pool.delete(b"seed-7").unwrap_err().is_abandoned());

        let pool = survivor(&temp_dir);
        assert_eq!(pool.get(b"seed-7").unwrap(), None);
        assert_eq!(pool.size().unwrap(), 9);
        assert!(pool.check_consistency().unwrap());
    }

    #[test]
    fn test_crash_during_clear() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 50);

        let pool = crashing(&temp_dir, FaultPoint::ClearStarted);
        assert!(pool.clear().unwrap_err().is_abandoned());

        // The heap was not reset yet, so every committed record comes back
        let pool = survivor(&temp_dir);
        assert!(pool.check_consistency().unwrap());
        assert_eq!(pool.size().unwrap(), 50);
        assert_eq!(pool.keys().unwrap().len(), 50);
        assert_eq!(pool.get(b"seed-49").unwrap(), Some(b"49".to_vec()));

        pool.set(b"fresh", b"start").unwrap();
        assert_eq!(pool.get(b"fresh").unwrap(), Some(b"start".to_vec()));
    }

    #[test]
    fn test_crash_during_resize_keeps_every_entry() {
        let temp_dir = TempDir::new().unwrap();
        // 384 entries put the initial 512-bucket table at its load limit
        seed(&temp_dir, 384);

        let pool = crashing(&temp_dir, FaultPoint::ResizeInProgress);
        assert!(pool.set(b"trigger", b"grow").unwrap_err().is_abandoned());

        let pool = survivor(&temp_dir);
        assert!(pool.check_consistency().unwrap());
        assert_eq!(pool.get(b"trigger").unwrap(), None);
        assert_eq!(pool.size().unwrap(), 384);
        for i in (0..384).step_by(17) {
            assert_eq!(
                pool.get(format!("seed-{i}").as_bytes()).unwrap(),
                Some(format!("{i}").into_bytes())
            );
        }
    }

    #[test]
    fn test_every_fault_point_leaves_a_recoverable_pool() {
        let points = FaultPoint::ALL
            .into_iter()
            .filter(|p| *p != FaultPoint::RecoveryStarted);
        for point in points {
            let temp_dir = TempDir::new().unwrap();
            seed(&temp_dir, 384);

            let pool = crashing(&temp_dir, point);
            // Later operations time out on our own abandoned lock
            let outcomes = [
                pool.set(b"new-key", b"v"),
                pool.set(b"seed-1", b"updated"),
                pool.delete(b"seed-2").map(|_| ()),
                pool.clear(),
            ];
            assert!(
                outcomes.iter().any(|r| matches!(r, Err(e) if e.is_abandoned())),
                "{point:?} never triggered"
            );

            let pool = survivor(&temp_dir);
            assert!(pool.check_consistency().unwrap(), "{point:?}");
            let status = pool.status().unwrap();
            assert_eq!(status.used_bytes + status.free_bytes, status.total_bytes);
            assert_eq!(pool.size().unwrap(), pool.keys().unwrap().len());
            pool.set(b"after", b"crash").unwrap();
        }
    }

    #[test]
    fn test_recovery_with_odd_granularity_keeps_records() {
        let temp_dir = TempDir::new().unwrap();
        let odd = |opts: PoolOptions| opts.with_min_alloc_size(65);
        let pool = Pool::create_or_open(odd(options(&temp_dir))).unwrap();
        for i in 0..50 {
            pool.set(format!("key-{i}").as_bytes(), &vec![i as u8; i * 11]).unwrap();
        }

        let crashing = Pool::open(
            odd(options(&temp_dir))
                .with_fault_injector(Arc::new(AbandonAt(FaultPoint::RecordWritten))),
        )
        .unwrap();
        assert!(crashing.set(b"key-7", b"rewritten").unwrap_err().is_abandoned());

        let pool = survivor(&temp_dir);
        assert!(pool.check_consistency().unwrap());
        assert_eq!(pool.size().unwrap(), 50);
        assert_eq!(pool.get(b"key-7").unwrap(), Some(b"rewritten".to_vec()));
        assert_eq!(pool.get(b"key-49").unwrap(), Some(vec![49u8; 49 * 11]));
    }

    #[test]
    fn test_crash_during_recovery_is_recovered_again() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 10);

        let pool = crashing(&temp_dir, FaultPoint::RecordWritten);
        assert!(pool.set(b"seed-4", b"second").unwrap_err().is_abandoned());

        let recovering = Pool::open(
            options(&temp_dir)
                .with_fault_injector(Arc::new(AbandonAt(FaultPoint::RecoveryStarted)))
                .with_process_probe(Arc::new(AssumeDead))
                .with_lock_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        assert!(recovering.get(b"seed-4").unwrap_err().is_abandoned());

        let pool = survivor(&temp_dir);
        assert_eq!(pool.get(b"seed-4").unwrap(), Some(b"second".to_vec()));
        assert_eq!(pool.size().unwrap(), 10);
        assert!(pool.check_consistency().unwrap());
    }

    #[test]
    fn test_live_holder_times_out() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 1);

        let pool = crashing(&temp_dir, FaultPoint::LockAcquired);
        assert!(pool.get(b"seed-0").unwrap_err().is_abandoned());

        // This process holds the lock and is certainly alive
        let waiter = Pool::open(
            options(&temp_dir)
                .with_process_probe(Arc::new(OsProbe))
                .with_lock_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        match waiter.get(b"seed-0").unwrap_err() {
            PoolError::LockTimeout { holder, waited_ms } => {
                assert_eq!(holder, std::process::id());
                assert!(waited_ms >= 100);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Forcing the drop works regardless of the holder
        let forced = options(&temp_dir).with_process_probe(Arc::new(AssumeAlive));
        Pool::drop_pool(&forced, true).unwrap();
        assert!(!temp_dir.path().join("recovery.pool").exists());
    }

    #[test]
    fn test_check_repairs_abandoned_pool() {
        let temp_dir = TempDir::new().unwrap();
        seed(&temp_dir, 20);

        let pool = crashing(&temp_dir, FaultPoint::RecordPublished);
        assert!(pool.set(b"seed-5", b"new").unwrap_err().is_abandoned());

        let checked = Pool::check(
            options(&temp_dir)
                .with_process_probe(Arc::new(AssumeDead))
                .with_lock_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        assert!(checked);

        let pool = Pool::open(options(&temp_dir)).unwrap();
        assert_eq!(pool.recoveries().unwrap(), 1);
        assert_eq!(pool.get(b"seed-5").unwrap(), Some(b"new".to_vec()));
        assert_eq!(pool.size().unwrap(), 20);
    }
}
