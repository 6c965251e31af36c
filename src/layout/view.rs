//! Typed access to the pool header of a mapped region

use std::{marker::PhantomData, ptr, sync::atomic::AtomicU64};

use crate::{
    error::{PoolError, Result},
    memory::MappedRegion,
};

use super::{constants::NUM_SIZE_CLASSES, headers::PoolHeader};

/// Accessors for the header fields living at offset 0 of a region
///
/// Fields are read and written through raw places, never through references
/// to the whole header, since other processes touch the lock word
/// concurrently.
#[derive(Debug, Clone, Copy)]
pub struct HeaderRef<'r> {
    ptr: *mut PoolHeader,
    _region: PhantomData<&'r MappedRegion>,
}

macro_rules! header_field {
    ($get:ident, $set:ident, $ty:ty) => {
        pub fn $get(&self) -> $ty {
            unsafe { ptr::addr_of!((*self.ptr).$get).read() }
        }

        pub fn $set(&self, value: $ty) {
            unsafe { ptr::addr_of_mut!((*self.ptr).$get).write(value) }
        }
    };
}

impl<'r> HeaderRef<'r> {
    /// View the header of `region`
    pub fn new(region: &'r MappedRegion) -> Result<Self> {
        if region.size() < PoolHeader::HEAP_START {
            return Err(PoolError::consistency(format!(
                "Region of {} bytes is too small for a pool header",
                region.size()
            )));
        }
        Ok(Self {
            ptr: region.base() as *mut PoolHeader,
            _region: PhantomData,
        })
    }

    /// Mutable access to the whole header, for initialization only
    ///
    /// # Safety
    /// No other process or thread may access the header concurrently.
    pub unsafe fn as_mut(&self) -> &mut PoolHeader {
        &mut *self.ptr
    }

    /// Validate the header against the mapped length
    pub fn validate(&self, mapped_len: u64) -> Result<()> {
        // Only plain fields are read; the lock words are not inspected
        let header = unsafe { &*self.ptr };
        header.validate(mapped_len)
    }

    header_field!(magic, set_magic, u64);
    header_field!(total_size, set_total_size, u64);
    header_field!(granularity, set_granularity, u64);
    header_field!(heap_start, set_heap_start, u64);
    header_field!(heap_end, set_heap_end, u64);
    header_field!(table, set_table, u64);
    header_field!(pending_table, set_pending_table, u64);
    header_field!(entry_count, set_entry_count, u64);
    header_field!(next_seq, set_next_seq, u64);
    header_field!(free_bytes, set_free_bytes, u64);
    header_field!(free_chunks, set_free_chunks, u64);
    header_field!(recoveries, set_recoveries, u64);
    header_field!(created_at, set_created_at, u64);

    /// Head of the free list for `class`
    pub fn free_list(&self, class: usize) -> u64 {
        debug_assert!(class < NUM_SIZE_CLASSES);
        unsafe { ptr::addr_of!((*self.ptr).free_lists[class]).read() }
    }

    /// Set the head of the free list for `class`
    pub fn set_free_list(&self, class: usize, offset: u64) {
        debug_assert!(class < NUM_SIZE_CLASSES);
        unsafe { ptr::addr_of_mut!((*self.ptr).free_lists[class]).write(offset) }
    }

    /// Take and bump the record sequence
    pub fn take_seq(&self) -> u64 {
        let seq = self.next_seq();
        self.set_next_seq(seq + 1);
        seq
    }

    /// Lock word shared by every process mapping the pool
    pub fn lock_word(&self) -> &'r AtomicU64 {
        unsafe { &*ptr::addr_of!((*self.ptr).lock) }
    }

    /// Time at which the lock was last taken
    pub fn lock_since(&self) -> &'r AtomicU64 {
        unsafe { &*ptr::addr_of!((*self.ptr).lock_since) }
    }
}
