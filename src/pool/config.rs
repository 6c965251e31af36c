//! Pool options

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    config::{DEFAULT_LOCK_TIMEOUT, DEFAULT_MIN_ALLOC_SIZE, DEFAULT_SIZE_MB, MIN_POOL_SIZE, PAGE_SIZE},
    error::{PoolError, Result},
    layout::{
        align_up, granularity_for, round_up, PoolHeader, TableHeader, BLOCK_HEADER_SIZE,
        INITIAL_BUCKETS, MAX_GRANULARITY,
    },
    memory::PoolIdentifier,
    sync::{FaultInjector, NoFaults, OsProbe, ProcessProbe},
};

const MIB: f64 = 1024.0 * 1024.0;

/// Options for creating, opening, checking or dropping a pool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Short pool name, resolved under the namespace root
    pub namespace: Option<String>,
    /// Explicit pool file path
    pub filename: Option<PathBuf>,
    /// Pool size in MiB when creating; 0 selects the default
    pub size_mb: f64,
    /// Smallest allocation unit requested
    pub min_alloc_size: u64,
    /// How long to wait on the pool lock before probing its holder
    pub lock_timeout: Duration,
    /// Directory for namespace pools, overriding the environment
    pub namespace_root: Option<PathBuf>,
    /// Crash-testing hook consulted at every fault point
    pub fault_injector: Arc<dyn FaultInjector>,
    /// Liveness check for lock holders
    pub process_probe: Arc<dyn ProcessProbe>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            filename: None,
            size_mb: 0.0,
            min_alloc_size: DEFAULT_MIN_ALLOC_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            namespace_root: None,
            fault_injector: Arc::new(NoFaults),
            process_probe: Arc::new(OsProbe),
        }
    }
}

impl PoolOptions {
    /// Options for the pool named `namespace`
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Options for the pool stored at `path`
    pub fn filename(path: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(path.into()),
            ..Default::default()
        }
    }

    /// Set the size in MiB used when the pool is created
    pub fn with_size_mb(mut self, size_mb: f64) -> Self {
        self.size_mb = size_mb;
        self
    }

    /// Set the minimum allocation size
    pub fn with_min_alloc_size(mut self, min_alloc_size: u64) -> Self {
        self.min_alloc_size = min_alloc_size;
        self
    }

    /// Set the lock wait interval
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the namespace root directory
    pub fn with_namespace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.namespace_root = Some(root.into());
        self
    }

    /// Install a fault injector
    pub fn with_fault_injector(mut self, injector: Arc<dyn FaultInjector>) -> Self {
        self.fault_injector = injector;
        self
    }

    /// Install a process liveness probe
    pub fn with_process_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.process_probe = probe;
        self
    }

    /// Identifier of the pool, requiring exactly one of namespace and filename
    pub fn identifier(&self) -> Result<PoolIdentifier> {
        match (&self.namespace, &self.filename) {
            (Some(namespace), None) => Ok(PoolIdentifier::Namespace(namespace.clone())),
            (None, Some(path)) => Ok(PoolIdentifier::Filename(path.clone())),
            (Some(_), Some(_)) => Err(PoolError::creation(
                "Only one of namespace and filename may be given",
            )),
            (None, None) => Err(PoolError::creation(
                "One of namespace and filename is required",
            )),
        }
    }

    /// Backing file path
    pub fn path(&self) -> Result<PathBuf> {
        self.identifier()?.resolve(self.namespace_root.as_deref())
    }

    /// Requested pool size in bytes, page aligned
    pub fn size_bytes(&self) -> Result<u64> {
        let mb = self.size_mb;
        if !mb.is_finite() || mb < 0.0 {
            return Err(PoolError::invalid_argument(
                "size_mb",
                format!("Pool size must be a non-negative number, got {}", mb),
            ));
        }
        let mb = if mb == 0.0 { DEFAULT_SIZE_MB } else { mb };
        let bytes = (mb * MIB).ceil();
        if bytes > (u64::MAX - PAGE_SIZE) as f64 {
            return Err(PoolError::invalid_argument("size_mb", "Pool size too large"));
        }
        let bytes = align_up(bytes as u64, PAGE_SIZE);
        if bytes < MIN_POOL_SIZE {
            return Err(PoolError::invalid_argument(
                "size_mb",
                format!("Pool size must be at least {} bytes", MIN_POOL_SIZE),
            ));
        }
        Ok(bytes)
    }

    /// Allocation granularity derived from the minimum allocation size
    pub fn granularity(&self) -> u64 {
        granularity_for(self.min_alloc_size)
    }

    /// Smallest pool holding the header, an initial table and one record
    /// block at `granularity`
    pub fn minimum_size(granularity: u64) -> u64 {
        let table_block = round_up(
            TableHeader::payload_len(INITIAL_BUCKETS) + BLOCK_HEADER_SIZE,
            granularity,
        );
        PoolHeader::HEAP_START + table_block + granularity
    }

    /// Namespace root in effect, when the pool is namespaced
    pub fn namespace_dir(&self) -> Option<PathBuf> {
        self.namespace
            .as_ref()
            .map(|_| crate::memory::namespaces_root(self.namespace_root.as_deref()))
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        self.identifier()?;
        let size = self.size_bytes()?;

        if self.min_alloc_size == 0 || self.min_alloc_size > MAX_GRANULARITY {
            return Err(PoolError::invalid_argument(
                "min_alloc_size",
                format!("Must be between 1 and {} bytes", MAX_GRANULARITY),
            ));
        }

        let minimum = Self::minimum_size(self.granularity());
        if size < minimum {
            return Err(PoolError::invalid_argument(
                "size_mb",
                format!(
                    "A pool with {} byte allocations needs at least {} bytes",
                    self.granularity(),
                    minimum
                ),
            ));
        }

        if self.lock_timeout.is_zero() {
            return Err(PoolError::invalid_argument(
                "lock_timeout",
                "Lock timeout cannot be zero",
            ));
        }

        if let Some(root) = &self.namespace_root {
            if root == Path::new("") {
                return Err(PoolError::invalid_argument(
                    "namespace_root",
                    "Namespace root cannot be empty",
                ));
            }
        }

        Ok(())
    }
}
