//! Memory allocation traits and the in-region free-list allocator

pub mod freelist;
pub mod size_class;
pub mod traits;

pub use freelist::{BlockIter, FreeListAllocator};
pub use size_class::{SizeClasses, LAST_CLASS};
pub use traits::{Allocator, AllocatorExt, AllocatorStatus};
