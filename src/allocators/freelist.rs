//! Segregated free-list allocator living entirely inside a mapped region
//!
//! The heap is a sequence of blocks, each starting with a [`BlockHeader`]
//! boundary tag (`size | flags`, `prev_size`). Free blocks also carry
//! [`FreeLinks`] and sit on one doubly linked list per size class; list heads
//! and the free counters live in the pool header. All state is reached
//! through offsets, so the allocator itself is a cheap view that any process
//! can build over its own mapping.
//!
//! Every structural change is committed by one block header write. Free
//! lists are derived state: after a crash they may disagree with the
//! physical walk and are rebuilt by recovery.

use crate::{
    error::{PoolError, Result},
    layout::{
        BlockHeader, BlockKind, FreeLinks, HeaderRef, RecordHeader, BLOCK_HEADER_SIZE,
        NUM_SIZE_CLASSES,
    },
    memory::MappedRegion,
};

use super::{
    size_class::{SizeClasses, LAST_CLASS},
    traits::{Allocator, AllocatorExt, AllocatorStatus},
};

/// Leading payload bytes cleared before a block is handed out
const PAYLOAD_SCRUB_LEN: u64 = RecordHeader::SIZE;

/// Free-list allocator view over a mapped pool
#[derive(Debug, Clone, Copy)]
pub struct FreeListAllocator<'r> {
    region: &'r MappedRegion,
    header: HeaderRef<'r>,
    classes: SizeClasses,
    heap_start: u64,
    heap_end: u64,
}

impl<'r> FreeListAllocator<'r> {
    /// Build a view from the geometry recorded in the pool header
    pub fn new(region: &'r MappedRegion) -> Result<Self> {
        let header = HeaderRef::new(region)?;
        let heap_start = header.heap_start();
        let heap_end = header.heap_end();
        if heap_end > region.size() || heap_start >= heap_end {
            return Err(PoolError::consistency("Heap bounds outside region"));
        }
        Ok(Self {
            region,
            header,
            classes: SizeClasses::new(header.granularity()),
            heap_start,
            heap_end,
        })
    }

    /// Size class mapping in use
    pub fn classes(&self) -> SizeClasses {
        self.classes
    }

    /// Heap bounds `[start, end)`
    pub fn heap_bounds(&self) -> (u64, u64) {
        (self.heap_start, self.heap_end)
    }

    /// Read the header of the block at `offset`
    pub fn block(&self, offset: u64) -> Result<BlockHeader> {
        self.check_block_offset(offset)?;
        self.region.read(offset)
    }

    /// Overwrite the header of the block at `offset`
    pub(crate) fn set_block(&self, offset: u64, header: BlockHeader) -> Result<()> {
        self.check_block_offset(offset)?;
        self.region.write(offset, header)
    }

    /// Iterate over the physical blocks of the heap
    pub fn blocks(&self) -> BlockIter<'r> {
        BlockIter {
            allocator: *self,
            next: self.heap_start,
            failed: false,
        }
    }

    fn check_block_offset(&self, offset: u64) -> Result<()> {
        if offset < self.heap_start
            || offset % 16 != 0
            || offset.saturating_add(BLOCK_HEADER_SIZE) > self.heap_end
        {
            return Err(PoolError::consistency(format!(
                "Block offset {} outside heap [{}, {})",
                offset, self.heap_start, self.heap_end
            )));
        }
        Ok(())
    }

    pub(crate) fn links(&self, offset: u64) -> Result<FreeLinks> {
        self.check_block_offset(offset)?;
        self.region.read(offset + BLOCK_HEADER_SIZE)
    }

    fn set_links(&self, offset: u64, links: FreeLinks) -> Result<()> {
        self.check_block_offset(offset)?;
        self.region.write(offset + BLOCK_HEADER_SIZE, links)
    }

    /// Rewrite the `prev_size` of the block following `offset + size`
    fn fix_successor(&self, offset: u64, size: u64) -> Result<()> {
        let next = offset + size;
        if next < self.heap_end {
            let mut header = self.block(next)?;
            header.prev_size = size;
            self.set_block(next, header)?;
        }
        Ok(())
    }

    /// Push a free block onto the head of its class list
    fn push_free(&self, offset: u64, size: u64) -> Result<()> {
        let class = self.classes.class_of(size);
        let head = self.header.free_list(class);
        self.set_links(offset, FreeLinks { next: head, prev: 0 })?;
        if head != 0 {
            let mut head_links = self.links(head)?;
            head_links.prev = offset;
            self.set_links(head, head_links)?;
        }
        self.header.set_free_list(class, offset);
        self.header.set_free_chunks(self.header.free_chunks() + 1);
        self.header.set_free_bytes(self.header.free_bytes() + size);
        Ok(())
    }

    /// Remove a free block from its class list
    fn unlink_free(&self, offset: u64, size: u64) -> Result<()> {
        let class = self.classes.class_of(size);
        let links = self.links(offset)?;
        if links.prev == 0 {
            if self.header.free_list(class) != offset {
                return Err(PoolError::consistency(format!(
                    "Free block {} is not the head of class {}",
                    offset, class
                )));
            }
            self.header.set_free_list(class, links.next);
        } else {
            let mut prev = self.links(links.prev)?;
            prev.next = links.next;
            self.set_links(links.prev, prev)?;
        }
        if links.next != 0 {
            let mut next = self.links(links.next)?;
            next.prev = links.prev;
            self.set_links(links.next, next)?;
        }
        self.header.set_free_chunks(self.header.free_chunks().saturating_sub(1));
        self.header.set_free_bytes(self.header.free_bytes().saturating_sub(size));
        Ok(())
    }

    /// Find a free block of at least `need` bytes
    ///
    /// Exact classes are taken first-fit from the smallest adequate class; the
    /// open-ended class is searched best-fit.
    fn find_fit(&self, need: u64) -> Result<Option<(u64, u64)>> {
        let first = self.classes.class_of(need);
        for class in first..NUM_SIZE_CLASSES {
            let head = self.header.free_list(class);
            if head == 0 {
                continue;
            }
            if class < LAST_CLASS {
                let size = self.block(head)?.size();
                return Ok(Some((head, size)));
            }

            let mut best: Option<(u64, u64)> = None;
            let mut current = head;
            let mut steps = 0u64;
            while current != 0 {
                let size = self.block(current)?.size();
                if size >= need && best.map_or(true, |(_, b)| size < b) {
                    best = Some((current, size));
                    if size == need {
                        break;
                    }
                }
                current = self.links(current)?.next;
                steps += 1;
                if steps > self.header.free_chunks() {
                    return Err(PoolError::consistency("Cycle in open-ended free list"));
                }
            }
            return Ok(best);
        }
        Ok(None)
    }

    /// Size of the largest free block
    pub fn largest_free(&self) -> Result<u64> {
        for class in (0..NUM_SIZE_CLASSES).rev() {
            let head = self.header.free_list(class);
            if head == 0 {
                continue;
            }
            if let Some(size) = self.classes.class_size(class) {
                return Ok(size);
            }

            let mut largest = 0;
            let mut current = head;
            let mut steps = 0u64;
            while current != 0 {
                largest = largest.max(self.block(current)?.size());
                current = self.links(current)?.next;
                steps += 1;
                if steps > self.header.free_chunks() {
                    return Err(PoolError::consistency("Cycle in open-ended free list"));
                }
            }
            return Ok(largest);
        }
        Ok(0)
    }

    /// Replace all free lists with the given free blocks
    ///
    /// Used by recovery after the physical block headers have been rewritten.
    pub(crate) fn rebuild_free_lists(&self, free_blocks: &[(u64, u64)]) -> Result<()> {
        for class in 0..NUM_SIZE_CLASSES {
            self.header.set_free_list(class, 0);
        }
        self.header.set_free_chunks(0);
        self.header.set_free_bytes(0);
        for &(offset, size) in free_blocks.iter().rev() {
            self.push_free(offset, size)?;
        }
        Ok(())
    }
}

impl Allocator for FreeListAllocator<'_> {
    fn allocate(&self, size: u64, kind: BlockKind) -> Result<u64> {
        let heap_len = self.heap_end - self.heap_start;
        let need = match self.classes.block_size_for(size) {
            Some(need) if need <= heap_len => need,
            _ => return Err(PoolError::out_of_memory(size, self.largest_free()?)),
        };

        let Some((offset, block_size)) = self.find_fit(need)? else {
            return Err(PoolError::out_of_memory(need, self.largest_free()?));
        };

        let prev_size = self.block(offset)?.prev_size;
        self.unlink_free(offset, block_size)?;
        // Stale record bytes must not look committed once the block is used
        self.region.fill(
            offset + BLOCK_HEADER_SIZE,
            (need - BLOCK_HEADER_SIZE).min(PAYLOAD_SCRUB_LEN),
            0,
        )?;

        let remainder = block_size - need;
        if remainder >= self.classes.granularity() {
            let rest = offset + need;
            self.set_block(rest, BlockHeader::free(remainder, need))?;
            self.set_block(offset, BlockHeader::used(need, prev_size, kind))?;
            self.fix_successor(rest, remainder)?;
            self.push_free(rest, remainder)?;
        } else {
            self.set_block(offset, BlockHeader::used(block_size, prev_size, kind))?;
        }

        Ok(offset + BLOCK_HEADER_SIZE)
    }

    fn free(&self, offset: u64) -> Result<()> {
        let block = offset
            .checked_sub(BLOCK_HEADER_SIZE)
            .ok_or_else(|| PoolError::consistency(format!("Invalid payload offset {}", offset)))?;
        let header = self.block(block)?;
        if !header.is_used() {
            return Err(PoolError::consistency(format!("Double free of block {}", block)));
        }
        if block + header.size() > self.heap_end {
            return Err(PoolError::consistency(format!("Block {} overruns heap", block)));
        }

        let mut start = block;
        let mut size = header.size();
        let mut prev_size = header.prev_size;

        let next = block + size;
        if next < self.heap_end {
            let next_header = self.block(next)?;
            if !next_header.is_used() {
                self.unlink_free(next, next_header.size())?;
                size += next_header.size();
            }
        }

        if block > self.heap_start && prev_size > 0 {
            let prev = block
                .checked_sub(prev_size)
                .filter(|p| *p >= self.heap_start)
                .ok_or_else(|| PoolError::consistency(format!("Bad prev_size at {}", block)))?;
            let prev_header = self.block(prev)?;
            if prev_header.size() != prev_size {
                return Err(PoolError::consistency(format!(
                    "Boundary tag mismatch between {} and {}",
                    prev, block
                )));
            }
            if !prev_header.is_used() {
                self.unlink_free(prev, prev_size)?;
                start = prev;
                size += prev_size;
                prev_size = prev_header.prev_size;
            }
        }

        self.set_block(start, BlockHeader::free(size, prev_size))?;
        self.fix_successor(start, size)?;
        self.push_free(start, size)
    }

    fn status(&self) -> Result<AllocatorStatus> {
        Ok(AllocatorStatus {
            total_bytes: self.header.total_size(),
            free_bytes: self.header.free_bytes(),
            free_chunks: self.header.free_chunks(),
            largest_chunk: self.largest_free()?,
        })
    }

    fn reset(&self) -> Result<()> {
        let len = self.heap_end - self.heap_start;
        self.set_block(self.heap_start, BlockHeader::free(len, 0))?;
        self.rebuild_free_lists(&[(self.heap_start, len)])
    }

    fn capacity(&self, offset: u64) -> Result<u64> {
        let block = offset
            .checked_sub(BLOCK_HEADER_SIZE)
            .ok_or_else(|| PoolError::consistency(format!("Invalid payload offset {}", offset)))?;
        let header = self.block(block)?;
        if !header.is_used() {
            return Err(PoolError::consistency(format!("Block {} is not allocated", block)));
        }
        Ok(header.size() - BLOCK_HEADER_SIZE)
    }

    fn granularity(&self) -> u64 {
        self.classes.granularity()
    }
}

impl AllocatorExt for FreeListAllocator<'_> {
    fn allocate_zeroed(&self, size: u64, kind: BlockKind) -> Result<u64> {
        let offset = self.allocate(size, kind)?;
        self.region.fill(offset, size, 0)?;
        Ok(offset)
    }
}

/// Walk over the physical heap blocks
///
/// Yields `(offset, header)` in address order and stops after the first
/// malformed header, which it reports as an error.
#[derive(Debug)]
pub struct BlockIter<'r> {
    allocator: FreeListAllocator<'r>,
    next: u64,
    failed: bool,
}

impl Iterator for BlockIter<'_> {
    type Item = Result<(u64, BlockHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.allocator.heap_end {
            return None;
        }
        let offset = self.next;
        let header = match self.allocator.block(offset) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let g = self.allocator.classes.granularity();
        let size = header.size();
        if size < g || size % g != 0 || offset + size > self.allocator.heap_end {
            self.failed = true;
            return Some(Err(PoolError::consistency(format!(
                "Malformed block at {}: size {}",
                offset, size
            ))));
        }
        if header.is_used() && header.kind().is_none() {
            self.failed = true;
            return Some(Err(PoolError::consistency(format!(
                "Used block at {} has unknown kind",
                offset
            ))));
        }

        self.next = offset + size;
        Some(Ok((offset, header)))
    }
}
