//! Pool file location, creation and mapping

pub mod config;
pub mod regions;

pub use config::{
    clean_namespace, namespaces_root, PoolIdentifier, RegionConfig, DEFAULT_NAMESPACES_ROOT,
    NAMESPACES_ROOT_ENV,
};
pub use regions::{MappedRegion, RegionInitializer};
