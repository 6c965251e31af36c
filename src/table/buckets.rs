//! Chained hash table stored in the pool heap
//!
//! The bucket array is one heap block of kind table: a [`TableHeader`]
//! followed by `bucket_count` slots holding record payload offsets. Records
//! chain through their `next` field. Each structural change ends with a
//! single word store that makes it visible (a slot, a `next` field or a
//! header field), so a crash leaves either the old or the new state
//! reachable and recovery only has to drop the leftovers.

use log::debug;

use crate::{
    allocators::{Allocator, AllocatorExt, FreeListAllocator},
    error::{PoolError, Result},
    layout::{
        BlockKind, HeaderRef, RecordHeader, TableHeader, BLOCK_HEADER_SIZE, INITIAL_BUCKETS,
        LOAD_FACTOR_DEN, LOAD_FACTOR_NUM, TABLE_HEADER_SIZE,
    },
    memory::MappedRegion,
    sync::fault::{checkpoint, FaultInjector, FaultPoint},
};

use super::{
    hash::{bucket_index, key_hash},
    record::{key_len, RecordRef, NEXT_OFFSET},
};

/// A record found by key, with the word that links to it
#[derive(Debug, Clone, Copy)]
struct Located {
    /// Offset of the slot or `next` field pointing at the record
    link: u64,
    /// Record payload offset
    record: u64,
}

/// Hash table view over a locked pool
#[derive(Debug, Clone, Copy)]
pub struct HashTable<'r> {
    region: &'r MappedRegion,
    header: HeaderRef<'r>,
    alloc: FreeListAllocator<'r>,
    faults: &'r dyn FaultInjector,
}

impl<'r> HashTable<'r> {
    /// View the table of `region`; the caller holds the pool lock
    pub fn new(region: &'r MappedRegion, faults: &'r dyn FaultInjector) -> Result<Self> {
        Ok(Self {
            region,
            header: HeaderRef::new(region)?,
            alloc: FreeListAllocator::new(region)?,
            faults,
        })
    }

    /// Allocate an empty bucket array of `bucket_count` buckets
    ///
    /// Returns the payload offset of the new table; nothing points at it yet.
    pub fn allocate_table(alloc: &FreeListAllocator<'_>, region: &MappedRegion, bucket_count: u64) -> Result<u64> {
        debug_assert!(bucket_count.is_power_of_two());
        let offset = alloc.allocate_zeroed(TableHeader::payload_len(bucket_count), BlockKind::Table)?;
        region.write(
            offset,
            TableHeader {
                bucket_count,
                reserved: 0,
            },
        )?;
        Ok(offset)
    }

    /// Allocate the initial table and install it in the header
    pub fn install_initial(&self) -> Result<()> {
        let table = Self::allocate_table(&self.alloc, self.region, INITIAL_BUCKETS)?;
        self.header.set_table(table);
        Ok(())
    }

    /// Bucket count of the table at `table`, checked against its block
    pub fn bucket_count_of(alloc: &FreeListAllocator<'_>, region: &MappedRegion, table: u64) -> Result<u64> {
        let capacity = alloc.capacity(table)?;
        let header: TableHeader = region.read(table)?;
        let count = header.bucket_count;
        if count == 0
            || !count.is_power_of_two()
            || TableHeader::payload_len(count) > capacity
        {
            return Err(PoolError::consistency(format!(
                "Table {} has invalid bucket count {}",
                table, count
            )));
        }
        Ok(count)
    }

    /// Offset of slot `index` of the table at `table`
    pub fn slot_offset(table: u64, index: u64) -> u64 {
        table + TABLE_HEADER_SIZE + index * 8
    }

    fn current(&self) -> Result<(u64, u64)> {
        let table = self.header.table();
        if table == 0 {
            return Err(PoolError::consistency("Pool has no bucket table"));
        }
        let count = Self::bucket_count_of(&self.alloc, self.region, table)?;
        Ok((table, count))
    }

    /// Upper bound on chain length before a cycle is assumed
    fn chain_limit(&self) -> u64 {
        let (start, end) = self.alloc.heap_bounds();
        (end - start) / self.alloc.granularity() + 1
    }

    /// Check a record offset read from a link before following it
    fn check_record(&self, offset: u64) -> Result<RecordRef<'r>> {
        let block = self.alloc.block(offset.saturating_sub(BLOCK_HEADER_SIZE))?;
        if block.kind() != Some(BlockKind::Record) {
            return Err(PoolError::consistency(format!(
                "Chain entry {} is not a record block",
                offset
            )));
        }
        Ok(RecordRef::new(self.region, offset))
    }

    fn locate(&self, key: &[u8]) -> Result<Option<Located>> {
        let (table, count) = self.current()?;
        let hash = key_hash(key);
        let mut link = Self::slot_offset(table, bucket_index(hash, count));
        let mut current: u64 = self.region.read(link)?;
        let limit = self.chain_limit();
        let mut steps = 0;

        while current != 0 {
            let record = self.check_record(current)?;
            if record.matches(key, hash)? {
                return Ok(Some(Located { link, record: current }));
            }
            link = current + NEXT_OFFSET;
            current = record.next()?;
            steps += 1;
            if steps > limit {
                return Err(PoolError::consistency("Cycle in bucket chain"));
            }
        }
        Ok(None)
    }

    /// Value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.locate(key)? {
            Some(found) => Ok(Some(RecordRef::new(self.region, found.record).value()?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite `key`
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        // Reject before anything is allocated
        key_len(key.len())?;
        let payload = RecordHeader::payload_len(key.len() as u64, value.len() as u64);

        match self.locate(key)? {
            Some(found) => {
                let old = RecordRef::new(self.region, found.record);
                let offset = self.alloc.allocate(payload, BlockKind::Record)?;
                checkpoint(self.faults, FaultPoint::RecordAllocated)?;

                let seq = self.header.take_seq();
                RecordRef::write(self.region, offset, key, value, seq, old.next()?)?;
                checkpoint(self.faults, FaultPoint::RecordWritten)?;

                self.region.write(found.link, offset)?;
                checkpoint(self.faults, FaultPoint::RecordPublished)?;

                self.alloc.free(found.record)
            }
            None => {
                let (table, count) = self.ensure_capacity()?;
                let offset = self.alloc.allocate(payload, BlockKind::Record)?;
                checkpoint(self.faults, FaultPoint::RecordAllocated)?;

                let slot = Self::slot_offset(table, bucket_index(key_hash(key), count));
                let head: u64 = self.region.read(slot)?;
                let seq = self.header.take_seq();
                RecordRef::write(self.region, offset, key, value, seq, head)?;
                checkpoint(self.faults, FaultPoint::RecordWritten)?;

                self.region.write(slot, offset)?;
                checkpoint(self.faults, FaultPoint::RecordPublished)?;

                self.header.set_entry_count(self.header.entry_count() + 1);
                Ok(())
            }
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let Some(found) = self.locate(key)? else {
            return Ok(false);
        };
        let record = RecordRef::new(self.region, found.record);
        record.mark_deleted()?;
        self.region.write(found.link, record.next()?)?;
        checkpoint(self.faults, FaultPoint::RecordUnlinked)?;

        self.header.set_entry_count(self.header.entry_count().saturating_sub(1));
        self.alloc.free(found.record)?;
        Ok(true)
    }

    /// Remove every record and start over with a fresh initial table
    pub fn clear(&self) -> Result<()> {
        self.header.set_table(0);
        self.header.set_entry_count(0);
        checkpoint(self.faults, FaultPoint::ClearStarted)?;

        self.alloc.reset()?;
        self.install_initial()
    }

    /// Number of live records
    pub fn len(&self) -> u64 {
        self.header.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored key, in bucket order
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::with_capacity(self.len() as usize);
        self.for_each_record(|record| {
            keys.push(record.key()?);
            Ok(())
        })?;
        Ok(keys)
    }

    fn for_each_record(&self, mut f: impl FnMut(RecordRef<'r>) -> Result<()>) -> Result<()> {
        let (table, count) = self.current()?;
        let limit = self.chain_limit();
        for index in 0..count {
            let mut current: u64 = self.region.read(Self::slot_offset(table, index))?;
            let mut steps = 0;
            while current != 0 {
                let record = self.check_record(current)?;
                let next = record.next()?;
                f(record)?;
                current = next;
                steps += 1;
                if steps > limit {
                    return Err(PoolError::consistency("Cycle in bucket chain"));
                }
            }
        }
        Ok(())
    }

    /// Grow the table if one more record would exceed the load factor
    fn ensure_capacity(&self) -> Result<(u64, u64)> {
        let (table, count) = self.current()?;
        if (self.len() + 1) * LOAD_FACTOR_DEN > count * LOAD_FACTOR_NUM {
            return self.resize(count * 2);
        }
        Ok((table, count))
    }

    /// Rehash every record into a table of `new_count` buckets
    pub fn resize(&self, new_count: u64) -> Result<(u64, u64)> {
        let (old_table, old_count) = self.current()?;
        let new_table = Self::allocate_table(&self.alloc, self.region, new_count)?;
        self.header.set_pending_table(new_table);
        debug!("resizing table {} -> {} buckets", old_count, new_count);

        for index in 0..old_count {
            if index == old_count / 2 {
                checkpoint(self.faults, FaultPoint::ResizeInProgress)?;
            }
            let mut current: u64 = self.region.read(Self::slot_offset(old_table, index))?;
            while current != 0 {
                let record = self.check_record(current)?;
                let next = record.next()?;
                let hash = record.header()?.key_hash;
                let slot = Self::slot_offset(new_table, bucket_index(hash, new_count));
                record.set_next(self.region.read(slot)?)?;
                self.region.write(slot, current)?;
                current = next;
            }
        }

        self.header.set_table(new_table);
        self.header.set_pending_table(0);
        self.alloc.free(old_table)?;
        Ok((new_table, new_count))
    }
}
