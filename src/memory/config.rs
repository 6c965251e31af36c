//! Configuration types for pool regions and pool identifiers

use std::{
    env,
    path::{Path, PathBuf},
};

use crate::error::{PoolError, Result};

/// Environment variable overriding the namespace root directory
pub const NAMESPACES_ROOT_ENV: &str = "SHMKV_NAMESPACES_ROOT_PATH";

/// Namespace root used when neither an option nor the environment sets one
pub const DEFAULT_NAMESPACES_ROOT: &str = "/var/tmp/shmkv";

/// File extension of namespace-identified pools
pub const POOL_FILE_EXTENSION: &str = "pool";

/// Longest accepted namespace, in bytes
pub const MAX_NAMESPACE_LEN: usize = 200;

/// How a pool is located on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolIdentifier {
    /// Short name resolved to a file under the namespace root
    Namespace(String),
    /// Explicit file path
    Filename(PathBuf),
}

impl PoolIdentifier {
    /// Resolve to the backing file path
    ///
    /// `root` overrides the namespace root; otherwise the environment and then
    /// the default are consulted.
    pub fn resolve(&self, root: Option<&Path>) -> Result<PathBuf> {
        match self {
            PoolIdentifier::Namespace(namespace) => {
                let cleaned = clean_namespace(namespace)?;
                Ok(namespaces_root(root).join(format!("{}.{}", cleaned, POOL_FILE_EXTENSION)))
            }
            PoolIdentifier::Filename(path) => {
                if path.as_os_str().is_empty() {
                    return Err(PoolError::creation("Filename cannot be empty"));
                }
                Ok(path.clone())
            }
        }
    }

    /// Whether the pool lives under the namespace root
    pub fn is_namespace(&self) -> bool {
        matches!(self, PoolIdentifier::Namespace(_))
    }
}

/// Directory holding namespace pools
pub fn namespaces_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(root) = explicit {
        return root.to_path_buf();
    }
    match env::var_os(NAMESPACES_ROOT_ENV) {
        Some(root) if !root.is_empty() => PathBuf::from(root),
        _ => PathBuf::from(DEFAULT_NAMESPACES_ROOT),
    }
}

/// Map a namespace to a file-name-safe string
///
/// Bytes outside `[A-Za-z0-9._-]` become `-`.
pub fn clean_namespace(namespace: &str) -> Result<String> {
    if namespace.is_empty() {
        return Err(PoolError::creation("Namespace cannot be empty"));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(PoolError::creation(format!(
            "Namespace longer than {} bytes",
            MAX_NAMESPACE_LEN
        )));
    }

    let cleaned: String = namespace
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' {
                b as char
            } else {
                '-'
            }
        })
        .collect();

    if cleaned == "." || cleaned == ".." {
        return Err(PoolError::creation(format!("Malformed namespace: {:?}", namespace)));
    }
    Ok(cleaned)
}

/// Configuration for creating or opening a mapped region
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Backing file path
    pub path: PathBuf,
    /// Total size of the region in bytes (used when creating)
    pub size: u64,
    /// Whether to create the file if it doesn't exist or is not initialized
    pub create: bool,
    /// Permissions for a newly created file (Unix permissions)
    pub permissions: u32,
    /// Free filesystem space required before creating
    pub min_free_space: u64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            size: 0,
            create: true,
            permissions: 0o644,
            min_free_space: 0,
        }
    }
}

impl RegionConfig {
    /// Create a new region configuration
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            ..Default::default()
        }
    }

    /// Set whether to create the region if it doesn't exist
    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Set the permissions for the region
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Set the free space the filesystem must report before creating
    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = bytes;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(PoolError::creation("Region path cannot be empty"));
        }

        if self.create && self.size == 0 {
            return Err(PoolError::invalid_argument(
                "size",
                "Region size must be greater than 0",
            ));
        }

        if self.path.file_name().is_none() {
            return Err(PoolError::creation(format!(
                "Region path {} does not name a file",
                self.path.display()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_namespace() {
        assert_eq!(clean_namespace("viewcounters").unwrap(), "viewcounters");
        assert_eq!(clean_namespace("a/b c").unwrap(), "a-b-c");
        assert_eq!(clean_namespace("v1.2_x-y").unwrap(), "v1.2_x-y");
        assert!(clean_namespace("").is_err());
        assert!(clean_namespace("..").is_err());
        assert!(clean_namespace(&"x".repeat(MAX_NAMESPACE_LEN + 1)).is_err());
    }

    #[test]
    fn test_resolve_namespace_with_explicit_root() {
        let id = PoolIdentifier::Namespace("counters".to_string());
        let path = id.resolve(Some(Path::new("/tmp/pools"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/pools/counters.pool"));
        assert!(id.is_namespace());
    }

    #[test]
    fn test_resolve_filename() {
        let id = PoolIdentifier::Filename(PathBuf::from("./foo.lmc"));
        assert_eq!(id.resolve(None).unwrap(), PathBuf::from("./foo.lmc"));
        assert!(PoolIdentifier::Filename(PathBuf::new()).resolve(None).is_err());
    }

    #[test]
    fn test_region_config_validation() {
        let mut config = RegionConfig::default();
        assert!(config.validate().is_err());

        config.path = PathBuf::from("/tmp/region");
        assert!(config.validate().is_err());

        config.size = 4096;
        assert!(config.validate().is_ok());

        let open_only = RegionConfig::new("/tmp/region", 0).with_create(false);
        assert!(open_only.validate().is_ok());
    }
}
