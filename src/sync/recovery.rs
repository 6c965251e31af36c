//! Consistency verification and crash repair
//!
//! [`verify`] only reads and reports. [`repair`] rebuilds every piece of
//! derived state from the physical block walk: free lists, counters, bucket
//! chains and the entry count. Records survive repair when they are
//! committed and intact; for a key found more than once the highest sequence
//! number wins.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    allocators::FreeListAllocator,
    error::{PoolError, Result},
    layout::{
        BlockHeader, BlockKind, HeaderRef, BLOCK_HEADER_SIZE, INITIAL_BUCKETS, LOAD_FACTOR_DEN,
        LOAD_FACTOR_NUM, NUM_SIZE_CLASSES,
    },
    memory::MappedRegion,
    table::{bucket_index, HashTable, RecordRef, RecordState},
};

/// Findings of a consistency pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Human-readable description of every violation found
    pub issues: Vec<String>,
    /// Live records reached through the table
    pub records: u64,
    /// Free blocks found by the physical walk
    pub free_blocks: u64,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    fn issue(&mut self, message: impl Into<String>) {
        self.issues.push(message.into());
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_consistent() {
            return write!(f, "consistent ({} records, {} free blocks)", self.records, self.free_blocks);
        }
        writeln!(f, "{} issue(s):", self.issues.len())?;
        for issue in &self.issues {
            writeln!(f, "  - {}", issue)?;
        }
        Ok(())
    }
}

/// What a repair pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    /// Records kept and reindexed
    pub records_kept: u64,
    /// Record blocks released (uncommitted, deleted, corrupt or superseded)
    pub records_freed: u64,
    /// Table blocks released (abandoned resizes, detached tables)
    pub tables_freed: u64,
    /// Bytes turned free because the block walk hit a malformed header
    pub truncated_bytes: u64,
}

/// Check every structural invariant of the pool without modifying it
pub fn verify(region: &MappedRegion) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    let header = HeaderRef::new(region)?;
    if let Err(e) = header.validate(region.size()) {
        report.issue(format!("header: {}", e));
        return Ok(report);
    }
    let alloc = FreeListAllocator::new(region)?;
    let (heap_start, _) = alloc.heap_bounds();

    // Physical walk
    let mut blocks: HashMap<u64, BlockHeader> = HashMap::new();
    let mut free_blocks: HashSet<u64> = HashSet::new();
    let mut free_bytes = 0u64;
    let mut expected_prev = 0u64;
    let mut prev_free = false;
    for block in alloc.blocks() {
        let (offset, block) = match block {
            Ok(entry) => entry,
            Err(e) => {
                report.issue(format!("block walk: {}", e));
                return Ok(report);
            }
        };
        if block.prev_size != expected_prev {
            report.issue(format!(
                "block {} has prev_size {}, expected {}",
                offset, block.prev_size, expected_prev
            ));
        }
        if !block.is_used() {
            if prev_free {
                report.issue(format!("adjacent free blocks at {}", offset));
            }
            free_blocks.insert(offset);
            free_bytes += block.size();
        }
        prev_free = !block.is_used();
        expected_prev = block.size();
        blocks.insert(offset, block);
    }
    report.free_blocks = free_blocks.len() as u64;
    debug_assert!(blocks.contains_key(&heap_start));

    // Free lists
    let classes = alloc.classes();
    let mut listed: HashSet<u64> = HashSet::new();
    for class in 0..NUM_SIZE_CLASSES {
        let mut prev = 0;
        let mut current = header.free_list(class);
        while current != 0 {
            if !free_blocks.contains(&current) {
                report.issue(format!("free list {} links non-free block {}", class, current));
                break;
            }
            if !listed.insert(current) {
                report.issue(format!("free block {} listed twice", current));
                break;
            }
            if let Some(block) = blocks.get(&current) {
                if classes.class_of(block.size()) != class {
                    report.issue(format!("free block {} is in the wrong class {}", current, class));
                }
            }
            let links = alloc.links(current)?;
            if links.prev != prev {
                report.issue(format!("free block {} has a broken back link", current));
            }
            prev = current;
            current = links.next;
        }
    }
    if listed.len() != free_blocks.len() {
        report.issue(format!(
            "{} free blocks on lists, {} in the heap",
            listed.len(),
            free_blocks.len()
        ));
    }

    // Counters
    if header.free_bytes() != free_bytes {
        report.issue(format!(
            "free_bytes counter {} != walked {}",
            header.free_bytes(),
            free_bytes
        ));
    }
    if header.free_chunks() != free_blocks.len() as u64 {
        report.issue(format!(
            "free_chunks counter {} != walked {}",
            header.free_chunks(),
            free_blocks.len()
        ));
    }

    // Table
    if header.pending_table() != 0 {
        report.issue(format!("table resize pending at {}", header.pending_table()));
    }
    let table = header.table();
    let table_ok = blocks
        .get(&table.wrapping_sub(BLOCK_HEADER_SIZE))
        .map_or(false, |b| b.kind() == Some(BlockKind::Table));
    let bucket_count = if table_ok {
        match HashTable::bucket_count_of(&alloc, region, table) {
            Ok(count) => Some(count),
            Err(e) => {
                report.issue(format!("table: {}", e));
                None
            }
        }
    } else {
        report.issue(format!("header table {} is not a table block", table));
        None
    };
    for (offset, block) in &blocks {
        if block.kind() == Some(BlockKind::Table) && offset + BLOCK_HEADER_SIZE != table {
            report.issue(format!("unreferenced table block {}", offset));
        }
    }

    let mut reached: HashSet<u64> = HashSet::new();
    let mut keys: HashSet<Vec<u8>> = HashSet::new();
    if let Some(count) = bucket_count {
        for index in 0..count {
            let mut current: u64 = region.read(HashTable::slot_offset(table, index))?;
            while current != 0 {
                let block = blocks.get(&current.wrapping_sub(BLOCK_HEADER_SIZE));
                let Some(block) = block.filter(|b| b.kind() == Some(BlockKind::Record)) else {
                    report.issue(format!("bucket {} links {} which is not a record", index, current));
                    break;
                };
                if !reached.insert(current) {
                    report.issue(format!("record {} reached twice", current));
                    break;
                }
                let record = RecordRef::new(region, current);
                match record.validate(block.size() - BLOCK_HEADER_SIZE) {
                    Ok(rec) => {
                        if bucket_index(rec.key_hash, count) != index {
                            report.issue(format!("record {} is in the wrong bucket {}", current, index));
                        }
                        if !keys.insert(record.key()?) {
                            report.issue(format!("duplicate key at record {}", current));
                        }
                    }
                    Err(e) => report.issue(format!("bucket {}: {}", index, e)),
                }
                current = record.next()?;
            }
        }
    }
    report.records = reached.len() as u64;

    let record_blocks = blocks
        .values()
        .filter(|b| b.kind() == Some(BlockKind::Record))
        .count();
    if record_blocks != reached.len() {
        report.issue(format!(
            "{} record blocks in the heap, {} reachable",
            record_blocks,
            reached.len()
        ));
    }
    if header.entry_count() != reached.len() as u64 {
        report.issue(format!(
            "entry_count {} != reachable records {}",
            header.entry_count(),
            reached.len()
        ));
    }

    Ok(report)
}

/// Physical block as seen by the repair walk
#[derive(Debug, Clone, Copy)]
struct Slab {
    offset: u64,
    size: u64,
    kind: Option<BlockKind>,
}

/// Surviving record found during repair
#[derive(Debug, Clone, Copy)]
struct Survivor {
    offset: u64,
    seq: u64,
    hash: u32,
}

/// Rebuild all derived state of a pool from its block walk
///
/// Only an invalid pool header makes repair fail.
pub fn repair(region: &MappedRegion) -> Result<RepairSummary> {
    let header = HeaderRef::new(region)?;
    header
        .validate(region.size())
        .map_err(|e| PoolError::recovery_failed(format!("Pool header is unrepairable: {}", e)))?;
    let alloc = FreeListAllocator::new(region)?;
    let (heap_start, heap_end) = alloc.heap_bounds();
    let mut summary = RepairSummary::default();

    // Walk until the first malformed block; the rest of the heap becomes free
    let mut slabs: Vec<Slab> = Vec::new();
    let mut cursor = heap_start;
    for block in alloc.blocks() {
        match block {
            Ok((offset, block)) => {
                slabs.push(Slab {
                    offset,
                    size: block.size(),
                    kind: block.kind(),
                });
                cursor = offset + block.size();
            }
            Err(e) => {
                warn!("repair: {}; freeing {} trailing bytes", e, heap_end - cursor);
                summary.truncated_bytes = heap_end - cursor;
                slabs.push(Slab {
                    offset: cursor,
                    size: heap_end - cursor,
                    kind: None,
                });
                break;
            }
        }
    }

    // Decide what survives
    let table = header.table();
    let mut keep_table = None;
    let mut newest: HashMap<Vec<u8>, Survivor> = HashMap::new();
    for slab in slabs.iter_mut() {
        let payload = slab.offset + BLOCK_HEADER_SIZE;
        match slab.kind {
            Some(BlockKind::Table) => {
                let valid = payload == table
                    && keep_table.is_none()
                    && HashTable::bucket_count_of(&alloc, region, payload).is_ok();
                if valid {
                    keep_table = Some(payload);
                } else {
                    debug!("repair: releasing table block {}", slab.offset);
                    summary.tables_freed += 1;
                    slab.kind = None;
                }
            }
            Some(BlockKind::Record) => {
                let record = RecordRef::new(region, payload);
                match record.validate(slab.size - BLOCK_HEADER_SIZE) {
                    Ok(rec) => {
                        let candidate = Survivor {
                            offset: payload,
                            seq: rec.seq,
                            hash: rec.key_hash,
                        };
                        let key = record.key()?;
                        match newest.get(&key) {
                            Some(kept) if kept.seq > candidate.seq => release_record(region, payload)?,
                            Some(kept) => {
                                release_record(region, kept.offset)?;
                                newest.insert(key, candidate);
                            }
                            None => {
                                newest.insert(key, candidate);
                            }
                        }
                    }
                    Err(e) => {
                        if record.state()? != RecordState::Deleted {
                            warn!("repair: dropping record {}: {}", payload, e);
                        }
                        summary.records_freed += 1;
                        slab.kind = None;
                    }
                }
            }
            None => {}
        }
    }

    // Superseded duplicates were marked deleted above; release their blocks
    for slab in slabs.iter_mut() {
        if slab.kind == Some(BlockKind::Record) {
            let state = RecordRef::new(region, slab.offset + BLOCK_HEADER_SIZE).state()?;
            if state != RecordState::Committed {
                summary.records_freed += 1;
                slab.kind = None;
            }
        }
    }

    // Merge free runs and rewrite every block header with coherent prev_size
    let mut merged: Vec<Slab> = Vec::with_capacity(slabs.len());
    for slab in slabs {
        match merged.last_mut() {
            Some(last) if last.kind.is_none() && slab.kind.is_none() => last.size += slab.size,
            _ => merged.push(slab),
        }
    }
    let mut prev_size = 0;
    let mut free_blocks = Vec::new();
    for slab in &merged {
        let block = match slab.kind {
            Some(kind) => BlockHeader::used(slab.size, prev_size, kind),
            None => {
                free_blocks.push((slab.offset, slab.size));
                BlockHeader::free(slab.size, prev_size)
            }
        };
        alloc.set_block(slab.offset, block)?;
        prev_size = slab.size;
    }
    alloc.rebuild_free_lists(&free_blocks)?;

    // Reindex the survivors
    let mut survivors: Vec<Survivor> = newest.into_values().collect();
    survivors.sort_by_key(|s| s.offset);
    let wanted = buckets_for(survivors.len() as u64);

    let (table, bucket_count) = match keep_table {
        Some(table) => {
            let count = HashTable::bucket_count_of(&alloc, region, table)?;
            region.fill(HashTable::slot_offset(table, 0), count * 8, 0)?;
            (table, count)
        }
        None => {
            let table = HashTable::allocate_table(&alloc, region, wanted)
                .or_else(|_| HashTable::allocate_table(&alloc, region, INITIAL_BUCKETS))
                .map_err(|e| PoolError::recovery_failed(format!("No room for a bucket table: {}", e)))?;
            (table, HashTable::bucket_count_of(&alloc, region, table)?)
        }
    };

    let mut max_seq = 0;
    for survivor in &survivors {
        let slot = HashTable::slot_offset(table, bucket_index(survivor.hash, bucket_count));
        let record = RecordRef::new(region, survivor.offset);
        record.set_next(region.read(slot)?)?;
        region.write(slot, survivor.offset)?;
        max_seq = max_seq.max(survivor.seq);
    }

    header.set_pending_table(0);
    header.set_table(table);
    header.set_entry_count(survivors.len() as u64);
    if header.next_seq() <= max_seq {
        header.set_next_seq(max_seq + 1);
    }
    summary.records_kept = survivors.len() as u64;

    debug!("repair finished: {:?}", summary);
    Ok(summary)
}

/// Mark a record deleted so no later pass can revive it
fn release_record(region: &MappedRegion, payload: u64) -> Result<()> {
    RecordRef::new(region, payload).mark_deleted()
}

/// Smallest power-of-two bucket count holding `records` under the load factor
fn buckets_for(records: u64) -> u64 {
    let mut count = INITIAL_BUCKETS;
    while (records + 1) * LOAD_FACTOR_DEN > count * LOAD_FACTOR_NUM {
        count *= 2;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::traits::Allocator;
    use crate::{
        layout::{RecordHeader, POOL_MAGIC},
        memory::{RegionConfig, RegionInitializer},
        sync::fault::{AbandonAt, FaultPoint, NoFaults},
    };
    use tempfile::TempDir;

    struct Fresh;

    impl RegionInitializer for Fresh {
        fn is_initialized(&self, _region: &MappedRegion) -> bool {
            false
        }

        fn initialize(&self, region: &MappedRegion) -> Result<()> {
            let header = HeaderRef::new(region)?;
            unsafe { header.as_mut() }.initialize(region.size(), 64);
            FreeListAllocator::new(region)?.reset()?;
            HashTable::new(region, &NoFaults)?.install_initial()?;
            header.set_magic(POOL_MAGIC);
            Ok(())
        }
    }

    fn pool(dir: &TempDir) -> MappedRegion {
        MappedRegion::create(&RegionConfig::new(dir.path().join("repair"), 512 * 1024), &Fresh).unwrap()
    }

    fn fill(region: &MappedRegion, n: u32) {
        let table = HashTable::new(region, &NoFaults).unwrap();
        for i in 0..n {
            table.set(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_fresh_and_populated_pools_verify() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        assert!(verify(&region).unwrap().is_consistent());

        fill(&region, 500);
        HashTable::new(&region, &NoFaults).unwrap().delete(b"key-3").unwrap();
        let report = verify(&region).unwrap();
        assert!(report.is_consistent(), "{}", report);
        assert_eq!(report.records, 499);
    }

    #[test]
    fn test_repair_is_a_no_op_on_a_consistent_pool() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 100);

        let summary = repair(&region).unwrap();
        assert_eq!(summary.records_kept, 100);
        assert_eq!(summary.records_freed, 0);
        assert!(verify(&region).unwrap().is_consistent());
        assert_eq!(
            HashTable::new(&region, &NoFaults).unwrap().get(b"key-42").unwrap(),
            Some(b"value-42".to_vec())
        );
    }

    #[test]
    fn test_repair_frees_uncommitted_record() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 10);

        let injector = AbandonAt(FaultPoint::RecordAllocated);
        let table = HashTable::new(&region, &injector).unwrap();
        assert!(table.set(b"partial", b"value").unwrap_err().is_abandoned());
        assert!(!verify(&region).unwrap().is_consistent());

        let summary = repair(&region).unwrap();
        assert_eq!(summary.records_freed, 1);
        assert!(verify(&region).unwrap().is_consistent());
        let table = HashTable::new(&region, &NoFaults).unwrap();
        assert_eq!(table.get(b"partial").unwrap(), None);
        assert_eq!(table.len(), 10);
    }

    #[test]
    fn test_repair_completes_interrupted_overwrite() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 10);

        let injector = AbandonAt(FaultPoint::RecordWritten);
        let table = HashTable::new(&region, &injector).unwrap();
        assert!(table.set(b"key-1", b"newer").unwrap_err().is_abandoned());

        repair(&region).unwrap();
        assert!(verify(&region).unwrap().is_consistent());
        let table = HashTable::new(&region, &NoFaults).unwrap();
        assert_eq!(table.get(b"key-1").unwrap(), Some(b"newer".to_vec()));
        assert_eq!(table.len(), 10);
    }

    #[test]
    fn test_repair_does_not_resurrect_deleted_record() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 10);

        let injector = AbandonAt(FaultPoint::RecordUnlinked);
        let table = HashTable::new(&region, &injector).unwrap();
        assert!(table.delete(b"key-5").unwrap_err().is_abandoned());

        repair(&region).unwrap();
        let table = HashTable::new(&region, &NoFaults).unwrap();
        assert_eq!(table.get(b"key-5").unwrap(), None);
        assert_eq!(table.len(), 9);
        assert!(verify(&region).unwrap().is_consistent());
    }

    #[test]
    fn test_repair_after_interrupted_resize() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 384);

        // The next new key crosses the load factor and triggers a resize
        let injector = AbandonAt(FaultPoint::ResizeInProgress);
        let table = HashTable::new(&region, &injector).unwrap();
        assert!(table.set(b"one-more", b"x").unwrap_err().is_abandoned());
        assert_ne!(HeaderRef::new(&region).unwrap().pending_table(), 0);

        let summary = repair(&region).unwrap();
        assert_eq!(summary.tables_freed, 1);
        assert!(verify(&region).unwrap().is_consistent());
        let table = HashTable::new(&region, &NoFaults).unwrap();
        assert_eq!(table.len(), 384);
        for i in 0..384 {
            assert!(table.get(format!("key-{i}").as_bytes()).unwrap().is_some());
        }
    }

    #[test]
    fn test_interrupted_clear_rolls_back() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 20);

        let injector = AbandonAt(FaultPoint::ClearStarted);
        let table = HashTable::new(&region, &injector).unwrap();
        assert!(table.clear().unwrap_err().is_abandoned());

        repair(&region).unwrap();
        assert!(verify(&region).unwrap().is_consistent());
        assert_eq!(HashTable::new(&region, &NoFaults).unwrap().len(), 20);
    }

    #[test]
    fn test_repair_rebuilds_damaged_free_lists_and_counters() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 50);
        let table = HashTable::new(&region, &NoFaults).unwrap();
        for i in (0..50).step_by(2) {
            table.delete(format!("key-{i}").as_bytes()).unwrap();
        }

        let header = HeaderRef::new(&region).unwrap();
        for class in 0..NUM_SIZE_CLASSES {
            header.set_free_list(class, 0);
        }
        header.set_free_bytes(12345);
        header.set_entry_count(1000);
        assert!(!verify(&region).unwrap().is_consistent());

        repair(&region).unwrap();
        assert!(verify(&region).unwrap().is_consistent());
        assert_eq!(HashTable::new(&region, &NoFaults).unwrap().len(), 25);
    }

    #[test]
    fn test_repair_truncates_at_malformed_block() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 30);

        // Find the last record block and smash its header
        let alloc = FreeListAllocator::new(&region).unwrap();
        let last_record = alloc
            .blocks()
            .map(|b| b.unwrap())
            .filter(|(_, b)| b.kind() == Some(BlockKind::Record))
            .map(|(offset, _)| offset)
            .last()
            .unwrap();
        region.write::<u64>(last_record, 3).unwrap();

        let summary = repair(&region).unwrap();
        assert!(summary.truncated_bytes > 0);
        assert!(verify(&region).unwrap().is_consistent());
        assert_eq!(HashTable::new(&region, &NoFaults).unwrap().len(), 29);
    }

    #[test]
    fn test_corrupt_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        fill(&region, 5);

        let table = HashTable::new(&region, &NoFaults).unwrap();
        table.set(b"victim", b"payload").unwrap();
        let alloc = FreeListAllocator::new(&region).unwrap();
        let victim = alloc
            .blocks()
            .map(|b| b.unwrap())
            .filter(|(_, b)| b.kind() == Some(BlockKind::Record))
            .map(|(offset, _)| offset + BLOCK_HEADER_SIZE)
            .find(|&payload| RecordRef::new(&region, payload).key().unwrap() == b"victim")
            .unwrap();
        region
            .write::<u8>(victim + RecordHeader::SIZE + 6, b'!')
            .unwrap();
        assert!(!verify(&region).unwrap().is_consistent());

        repair(&region).unwrap();
        let table = HashTable::new(&region, &NoFaults).unwrap();
        assert_eq!(table.get(b"victim").unwrap(), None);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_corrupt_header_is_unrepairable() {
        let dir = TempDir::new().unwrap();
        let region = pool(&dir);
        HeaderRef::new(&region).unwrap().set_magic(0);
        assert!(matches!(repair(&region), Err(PoolError::RecoveryFailed { .. })));
        assert!(!verify(&region).unwrap().is_consistent());
    }

    #[test]
    fn test_buckets_for_respects_load_factor() {
        assert_eq!(buckets_for(0), INITIAL_BUCKETS);
        assert_eq!(buckets_for(383), 512);
        assert_eq!(buckets_for(384), 1024);
    }
}
