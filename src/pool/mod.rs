//! Pool engine: options, handle and status

pub mod config;
pub mod handle;
pub mod status;

pub use config::PoolOptions;
pub use handle::Pool;
pub use status::PoolStatus;
