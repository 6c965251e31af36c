//! Pool handle: the public face of the engine
//!
//! A [`Pool`] maps one pool file into this process. Every instance operation
//! checks that the handle is open, takes the pool lock (repairing the pool if
//! a dead process left it held), works on the table through region offsets
//! and releases the lock.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    allocators::{Allocator, FreeListAllocator},
    error::{PoolError, Result},
    layout::{HeaderRef, POOL_MAGIC},
    memory::{MappedRegion, RegionConfig, RegionInitializer},
    sync::{repair, verify, ConsistencyReport, FaultInjector, NoFaults, PoolLock, ProcessProbe},
    table::HashTable,
};

use super::{config::PoolOptions, status::PoolStatus};

/// Lays down a fresh pool: header, one free heap block, an empty table
#[derive(Debug, Clone, Copy)]
struct PoolInitializer {
    granularity: u64,
}

impl RegionInitializer for PoolInitializer {
    fn is_initialized(&self, region: &MappedRegion) -> bool {
        HeaderRef::new(region)
            .and_then(|header| header.validate(region.size()))
            .is_ok()
    }

    fn initialize(&self, region: &MappedRegion) -> Result<()> {
        let header = HeaderRef::new(region)?;
        // The file lock is held and no valid header exists yet
        unsafe { header.as_mut() }.initialize(region.size(), self.granularity);
        FreeListAllocator::new(region)?.reset()?;
        HashTable::new(region, &NoFaults)?.install_initial()?;
        header.set_magic(POOL_MAGIC);
        Ok(())
    }
}

/// Handle on a shared key-value pool
#[derive(Debug)]
pub struct Pool {
    region: Option<MappedRegion>,
    path: PathBuf,
    lock_timeout: Duration,
    fault_injector: Arc<dyn FaultInjector>,
    process_probe: Arc<dyn ProcessProbe>,
}

impl Pool {
    /// Open the pool, creating it when it does not exist or is not a valid pool
    ///
    /// An existing pool keeps its stored size and granularity.
    pub fn create_or_open(options: PoolOptions) -> Result<Self> {
        options.validate()?;
        let path = options.path()?;
        if let Some(dir) = options.namespace_dir() {
            fs::create_dir_all(&dir).map_err(|e| {
                PoolError::creation_io(e, &format!("Failed to create namespace root {}", dir.display()))
            })?;
        }

        let granularity = options.granularity();
        let config = RegionConfig::new(&path, options.size_bytes()?)
            .with_min_free_space(PoolOptions::minimum_size(granularity));
        let region = MappedRegion::create(&config, &PoolInitializer { granularity })?;
        debug!("pool {} ready ({} bytes)", path.display(), region.size());

        Ok(Self::from_region(region, path, &options))
    }

    /// Open an existing pool
    pub fn open(options: PoolOptions) -> Result<Self> {
        options.validate()?;
        let path = options.path()?;
        let region = Self::open_region(&path, &options)?;
        debug!("opened pool {} ({} bytes)", path.display(), region.size());
        Ok(Self::from_region(region, path, &options))
    }

    fn open_region(path: &Path, options: &PoolOptions) -> Result<MappedRegion> {
        let config = RegionConfig::new(path, 0).with_create(false);
        MappedRegion::open(
            &config,
            &PoolInitializer {
                granularity: options.granularity(),
            },
        )
    }

    fn from_region(region: MappedRegion, path: PathBuf, options: &PoolOptions) -> Self {
        Self {
            region: Some(region),
            path,
            lock_timeout: options.lock_timeout,
            fault_injector: Arc::clone(&options.fault_injector),
            process_probe: Arc::clone(&options.process_probe),
        }
    }

    /// Remove a pool file
    ///
    /// A missing pool is not an error. Without `force` the pool lock is taken
    /// first, so a live holder makes this fail with `LockTimeout`. With
    /// `force` the lock word is cleared and the file removed regardless of
    /// other handles, which are left pointing at an unlinked file.
    pub fn drop_pool(options: &PoolOptions, force: bool) -> Result<()> {
        let path = options.path()?;
        if !path.exists() {
            debug!("pool {} does not exist, nothing to drop", path.display());
            return Ok(());
        }

        if force {
            match Self::open_region(&path, options) {
                Ok(region) => {
                    let header = HeaderRef::new(&region)?;
                    PoolLock::new(header, options.lock_timeout, options.process_probe.as_ref())
                        .force_release();
                }
                Err(e) => warn!("force-dropping {} without a valid header: {}", path.display(), e),
            }
            MappedRegion::remove(&path)?;
            info!("force-dropped pool {}", path.display());
            return Ok(());
        }

        let region = Self::open_region(&path, options)?;
        let lock = PoolLock::new(
            HeaderRef::new(&region)?,
            options.lock_timeout,
            options.process_probe.as_ref(),
        );
        lock.with_lock(
            options.fault_injector.as_ref(),
            || repair(&region).map(|_| ()),
            || MappedRegion::remove(&path),
        )?;
        info!("dropped pool {}", path.display());
        Ok(())
    }

    /// Repair a pool now and report whether it is consistent afterwards
    pub fn check(options: PoolOptions) -> Result<bool> {
        let pool = Self::open(options)?;
        let region = pool.region()?;
        let report = pool.locked(|_| {
            let summary = repair(region)?;
            info!("check of {}: {:?}", pool.path.display(), summary);
            verify(region)
        })?;
        if !report.is_consistent() {
            warn!("pool {} still inconsistent after repair: {}", pool.path.display(), report);
        }
        Ok(report.is_consistent())
    }

    fn region(&self) -> Result<&MappedRegion> {
        self.region.as_ref().ok_or(PoolError::PoolClosed)
    }

    /// Run `op` on the table under the pool lock
    fn locked<T>(&self, op: impl FnOnce(&HashTable<'_>) -> Result<T>) -> Result<T> {
        let region = self.region()?;
        let faults = self.fault_injector.as_ref();
        let lock = PoolLock::new(
            HeaderRef::new(region)?,
            self.lock_timeout,
            self.process_probe.as_ref(),
        );
        lock.with_lock(
            faults,
            || repair(region).map(|_| ()),
            || op(&HashTable::new(region, faults)?),
        )
    }

    /// Value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.locked(|table| table.get(key))
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.locked(|table| table.set(key, value))
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.locked(|table| table.delete(key))
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        self.locked(|table| table.clear())?;
        info!("cleared pool {}", self.path.display());
        Ok(())
    }

    /// Number of entries
    pub fn size(&self) -> Result<usize> {
        self.locked(|table| Ok(table.len() as usize))
    }

    /// Every key, in no particular order
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.locked(|table| table.keys())
    }

    /// Memory usage
    pub fn status(&self) -> Result<PoolStatus> {
        let region = self.region()?;
        self.locked(|_| Ok(FreeListAllocator::new(region)?.status()?.into()))
    }

    /// Full consistency pass under the lock
    pub fn consistency_report(&self) -> Result<ConsistencyReport> {
        let region = self.region()?;
        self.locked(|_| verify(region))
    }

    /// Whether every structural invariant holds
    pub fn check_consistency(&self) -> Result<bool> {
        let report = self.consistency_report()?;
        if !report.is_consistent() {
            warn!("pool {} is inconsistent: {}", self.path.display(), report);
        }
        Ok(report.is_consistent())
    }

    /// Number of crash recoveries this pool has gone through
    pub fn recoveries(&self) -> Result<u64> {
        let region = self.region()?;
        self.locked(|_| Ok(HeaderRef::new(region)?.recoveries()))
    }

    /// Flush and unmap this process's view; the pool itself stays
    pub fn close(&mut self) -> Result<()> {
        if let Some(region) = self.region.take() {
            region.close()?;
            debug!("closed pool {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.region.is_some()
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}
