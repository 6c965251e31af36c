//! Memory-mapped pool file

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::fd::AsRawFd,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    ptr,
    sync::atomic::AtomicU64,
};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use nix::{
    fcntl::{flock, FlockArg},
    sys::statvfs::statvfs,
};

use crate::error::{PoolError, Result};

use super::config::RegionConfig;

/// Decides whether a mapped file already holds a usable layout and lays one
/// down when it does not
pub trait RegionInitializer {
    /// Whether the mapped bytes already form an initialized region
    fn is_initialized(&self, region: &MappedRegion) -> bool;

    /// Write a fresh layout into a newly sized region
    fn initialize(&self, region: &MappedRegion) -> Result<()>;
}

/// A file mapped into this process
///
/// Every process maps the file at its own base address, so the region only
/// hands out and accepts offsets; pointers are derived at the point of use.
#[derive(Debug)]
pub struct MappedRegion {
    /// Backing file path
    path: PathBuf,
    /// Memory mapping of the whole file
    mmap: MmapMut,
    /// Backing file, kept open for the lifetime of the mapping
    _file: File,
    /// Mapped length in bytes
    size: u64,
}

impl MappedRegion {
    /// Open the region, creating and initializing it when the file is missing
    /// or holds no valid layout
    pub fn create(config: &RegionConfig, init: &dyn RegionInitializer) -> Result<Self> {
        config.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(config.permissions)
            .open(&config.path)
            .map_err(|e| PoolError::creation_io(e, "Failed to create/open pool file"))?;

        let _lock = FileLock::exclusive(&file)?;

        let existing_len = file
            .metadata()
            .map_err(|e| PoolError::creation_io(e, "Failed to stat pool file"))?
            .len();

        if existing_len > 0 {
            let mmap = Self::create_mapping(&file, existing_len)?;
            let region = Self::from_parts(config.path.clone(), mmap, file, existing_len);
            if init.is_initialized(&region) {
                debug!("opened existing pool {} ({} bytes)", config.path.display(), existing_len);
                return Ok(region);
            }
            debug!("pool {} has no valid header, reinitializing", config.path.display());
            let Self { _file: file, mmap, .. } = region;
            drop(mmap);
            return Self::initialize_file(config, file, init);
        }

        Self::initialize_file(config, file, init)
    }

    /// Open an existing, initialized region
    pub fn open(config: &RegionConfig, init: &dyn RegionInitializer) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.path)
            .map_err(|e| PoolError::creation_io(e, "Failed to open existing pool file"))?;

        let _lock = FileLock::exclusive(&file)?;

        let len = file
            .metadata()
            .map_err(|e| PoolError::creation_io(e, "Failed to stat pool file"))?
            .len();
        if len == 0 {
            return Err(PoolError::creation(format!(
                "{} is empty, not a pool",
                config.path.display()
            )));
        }

        let mmap = Self::create_mapping(&file, len)?;
        let region = Self::from_parts(config.path.clone(), mmap, file, len);
        if !init.is_initialized(&region) {
            return Err(PoolError::creation(format!(
                "{} does not contain a valid pool header",
                config.path.display()
            )));
        }
        Ok(region)
    }

    /// Size, map and initialize a file while holding its advisory lock
    fn initialize_file(config: &RegionConfig, file: File, init: &dyn RegionInitializer) -> Result<Self> {
        Self::check_free_space(&config.path, config.min_free_space)?;

        // Sparse: only touched pages take disk space
        file.set_len(config.size)
            .map_err(|e| PoolError::creation_io(e, "Failed to set pool file size"))?;

        let mmap = Self::create_mapping(&file, config.size)?;
        let region = Self::from_parts(config.path.clone(), mmap, file, config.size);
        init.initialize(&region)?;
        region.flush()?;

        debug!("created pool {} ({} bytes)", config.path.display(), config.size);
        Ok(region)
    }

    fn from_parts(path: PathBuf, mmap: MmapMut, file: File, size: u64) -> Self {
        Self {
            path,
            mmap,
            _file: file,
            size,
        }
    }

    /// Fail when the filesystem holding `path` reports less than `needed` bytes
    fn check_free_space(path: &Path, needed: u64) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let stat = statvfs(dir).map_err(|e| {
            PoolError::creation_io(io::Error::from(e), "Failed to query filesystem space")
        })?;
        let available = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
        if available < needed {
            return Err(PoolError::creation(format!(
                "Insufficient disk space: {} bytes available, {} needed",
                available, needed
            )));
        }
        Ok(())
    }

    /// Create memory mapping for the backing file
    fn create_mapping(file: &File, size: u64) -> Result<MmapMut> {
        let len = usize::try_from(size)
            .map_err(|_| PoolError::creation(format!("Region size {} exceeds address space", size)))?;
        unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(file)
                .map_err(|e| PoolError::creation_io(e, "Failed to create memory mapping"))
        }
    }

    /// Delete a region file; returns whether a file was removed
    pub fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PoolError::from_io(e, "Failed to remove pool file")),
        }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped length in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Process-local base address of the mapping
    pub fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Check that `[offset, offset + len)` lies inside the region
    pub fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PoolError::consistency(format!(
                "Range {}+{} outside region of {} bytes",
                offset, len, self.size
            ))),
        }
    }

    /// Translate a region offset into a process-local pointer
    pub fn resolve(&self, offset: u64, len: u64) -> Result<*mut u8> {
        self.check_range(offset, len)?;
        Ok(unsafe { self.base().add(offset as usize) })
    }

    /// Translate a process-local pointer into a region offset
    pub fn offset_of(&self, ptr: *const u8) -> Result<u64> {
        let base = self.base() as usize;
        let addr = ptr as usize;
        if addr < base || addr - base >= self.size as usize {
            return Err(PoolError::consistency(format!(
                "Address {:#x} outside mapped region",
                addr
            )));
        }
        Ok((addr - base) as u64)
    }

    /// Read a plain-data value stored at `offset`
    ///
    /// `T` must be valid for any bit pattern. Callers hold the pool lock.
    pub fn read<T: Copy>(&self, offset: u64) -> Result<T> {
        let ptr = self.resolve(offset, std::mem::size_of::<T>() as u64)?;
        Ok(unsafe { ptr::read_unaligned(ptr as *const T) })
    }

    /// Write a plain-data value at `offset`
    pub fn write<T: Copy>(&self, offset: u64, value: T) -> Result<()> {
        let ptr = self.resolve(offset, std::mem::size_of::<T>() as u64)?;
        unsafe { ptr::write_unaligned(ptr as *mut T, value) };
        Ok(())
    }

    /// Copy bytes into the region
    pub fn copy_in(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let ptr = self.resolve(offset, bytes.len() as u64)?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    /// Copy bytes out of the region
    pub fn copy_out(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.with_bytes(offset, len, |bytes| bytes.to_vec())
    }

    /// Fill a range with one byte value
    pub fn fill(&self, offset: u64, len: u64, byte: u8) -> Result<()> {
        let ptr = self.resolve(offset, len)?;
        unsafe { ptr::write_bytes(ptr, byte, len as usize) };
        Ok(())
    }

    /// Borrow a range for the duration of `f`
    pub fn with_bytes<R>(&self, offset: u64, len: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let ptr = self.resolve(offset, len)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
        Ok(f(bytes))
    }

    /// Atomic view of an 8-byte aligned word
    pub fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        if offset % 8 != 0 {
            return Err(PoolError::consistency(format!("Unaligned atomic at {}", offset)));
        }
        let ptr = self.resolve(offset, 8)?;
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    /// Flush changes to the backing file
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| PoolError::from_io(e, "Failed to flush memory mapping"))
    }

    /// Flush and unmap this process's view
    pub fn close(self) -> Result<()> {
        self.flush()?;
        drop(self);
        Ok(())
    }
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Advisory `flock` held while a region's header is inspected or initialized
///
/// Holds its own duplicate of the descriptor; the lock belongs to the shared
/// open file description, so it covers the original handle too.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(file: &File) -> Result<Self> {
        let file = file
            .try_clone()
            .map_err(|e| PoolError::creation_io(e, "Failed to duplicate pool file handle"))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| {
            PoolError::creation_io(io::Error::from(e), "Failed to lock pool file")
        })?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Treats a region as initialized once its first byte is 0xAB
    struct MarkerInit;

    impl RegionInitializer for MarkerInit {
        fn is_initialized(&self, region: &MappedRegion) -> bool {
            region.read::<u8>(0).map(|b| b == 0xAB).unwrap_or(false)
        }

        fn initialize(&self, region: &MappedRegion) -> Result<()> {
            region.write::<u8>(0, 0xAB)
        }
    }

    #[test]
    fn test_create_then_reopen_keeps_contents() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegionConfig::new(temp_dir.path().join("region"), 8192);

        let region = MappedRegion::create(&config, &MarkerInit).unwrap();
        region.write::<u64>(64, 0xDEAD_BEEF).unwrap();
        region.close().unwrap();

        // A different requested size does not re-initialize
        let bigger = RegionConfig::new(temp_dir.path().join("region"), 16384);
        let region = MappedRegion::create(&bigger, &MarkerInit).unwrap();
        assert_eq!(region.size(), 8192);
        assert_eq!(region.read::<u64>(64).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_open_rejects_uninitialized_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let config = RegionConfig::new(&path, 4096).with_create(false);
        assert!(MappedRegion::open(&config, &MarkerInit).is_err());

        // create() re-initializes it instead
        let region = MappedRegion::create(&RegionConfig::new(&path, 4096), &MarkerInit).unwrap();
        assert_eq!(region.read::<u8>(0).unwrap(), 0xAB);
    }

    #[test]
    fn test_offset_translation_and_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegionConfig::new(temp_dir.path().join("bounds"), 4096);
        let region = MappedRegion::create(&config, &MarkerInit).unwrap();

        let ptr = region.resolve(128, 8).unwrap();
        assert_eq!(region.offset_of(ptr).unwrap(), 128);

        assert!(region.resolve(4090, 8).is_err());
        assert!(region.read::<u64>(u64::MAX - 2).is_err());
        assert!(region.atomic_u64(12).is_err());

        region.copy_in(256, b"hello").unwrap();
        assert_eq!(region.copy_out(256, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegionConfig::new(temp_dir.path().join("missing/dir/region"), 4096);
        let err = MappedRegion::create(&config, &MarkerInit).unwrap_err();
        assert!(matches!(err, PoolError::PoolCreationFailed { .. }));
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("removable");
        let region = MappedRegion::create(&RegionConfig::new(&path, 4096), &MarkerInit).unwrap();
        region.close().unwrap();

        assert!(MappedRegion::remove(&path).unwrap());
        assert!(!MappedRegion::remove(&path).unwrap());
    }
}
