//! Record blocks: header, key bytes, value bytes

use crate::{
    error::{PoolError, Result},
    layout::{RecordHeader, RECORD_COMMITTED, RECORD_DELETED},
    memory::MappedRegion,
};

use super::hash::{key_hash, record_checksum};

/// Offset of `next` inside a record payload
pub const NEXT_OFFSET: u64 = 0;
/// Offset of `state` inside a record payload
pub const STATE_OFFSET: u64 = 36;

/// Stored key length, rejecting keys the record header cannot describe
pub fn key_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| PoolError::invalid_argument("key", "Key longer than 4 GiB"))
}

/// Lifecycle of a record as stored in its `state` word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Fully written and checksummed
    Committed,
    /// A delete started on this record
    Deleted,
    /// Never finished (or garbage)
    Incomplete,
}

impl RecordState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            RECORD_COMMITTED => RecordState::Committed,
            RECORD_DELETED => RecordState::Deleted,
            _ => RecordState::Incomplete,
        }
    }
}

/// View of the record whose payload starts at `offset`
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'r> {
    region: &'r MappedRegion,
    offset: u64,
}

impl<'r> RecordRef<'r> {
    pub fn new(region: &'r MappedRegion, offset: u64) -> Self {
        Self { region, offset }
    }

    /// Payload offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Write a complete record and commit it
    ///
    /// Every byte is in place before the state word turns committed.
    pub fn write(
        region: &'r MappedRegion,
        offset: u64,
        key: &[u8],
        value: &[u8],
        seq: u64,
        next: u64,
    ) -> Result<Self> {
        let stored_key_len = key_len(key.len())?;
        let header = RecordHeader {
            next,
            seq,
            value_len: value.len() as u64,
            key_len: stored_key_len,
            key_hash: key_hash(key),
            checksum: record_checksum(key, value),
            state: 0,
        };
        region.write(offset, header)?;
        region.copy_in(offset + RecordHeader::SIZE, key)?;
        region.copy_in(offset + RecordHeader::SIZE + key.len() as u64, value)?;
        region.write::<u32>(offset + STATE_OFFSET, RECORD_COMMITTED)?;
        Ok(Self { region, offset })
    }

    pub fn header(&self) -> Result<RecordHeader> {
        self.region.read(self.offset)
    }

    pub fn state(&self) -> Result<RecordState> {
        Ok(RecordState::from_raw(self.region.read::<u32>(self.offset + STATE_OFFSET)?))
    }

    pub fn next(&self) -> Result<u64> {
        self.region.read(self.offset + NEXT_OFFSET)
    }

    pub fn set_next(&self, next: u64) -> Result<()> {
        self.region.write(self.offset + NEXT_OFFSET, next)
    }

    /// Mark the record deleted; it is never read again after this
    pub fn mark_deleted(&self) -> Result<()> {
        self.region.write::<u32>(self.offset + STATE_OFFSET, RECORD_DELETED)
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        self.region
            .copy_out(self.offset + RecordHeader::SIZE, u64::from(header.key_len))
    }

    pub fn value(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        self.region.copy_out(
            self.offset + RecordHeader::SIZE + u64::from(header.key_len),
            header.value_len,
        )
    }

    /// Whether the record holds `key`, comparing the stored hash first
    pub fn matches(&self, key: &[u8], hash: u32) -> Result<bool> {
        let header = self.header()?;
        if header.key_hash != hash || header.key_len as usize != key.len() {
            return Ok(false);
        }
        self.region.with_bytes(
            self.offset + RecordHeader::SIZE,
            u64::from(header.key_len),
            |stored| stored == key,
        )
    }

    /// Check a record against the payload capacity of its block
    ///
    /// Returns the header of a committed record whose lengths fit and whose
    /// checksum and key hash match its bytes.
    pub fn validate(&self, capacity: u64) -> Result<RecordHeader> {
        let header = self.header()?;
        if RecordState::from_raw(header.state) != RecordState::Committed {
            return Err(PoolError::consistency(format!(
                "Record {} is not committed (state {:#x})",
                self.offset, header.state
            )));
        }
        let len = u64::from(header.key_len)
            .checked_add(header.value_len)
            .and_then(|l| l.checked_add(RecordHeader::SIZE));
        if len.map_or(true, |l| l > capacity) {
            return Err(PoolError::consistency(format!(
                "Record {} lengths exceed its block",
                self.offset
            )));
        }
        let body_ok = self.region.with_bytes(
            self.offset + RecordHeader::SIZE,
            u64::from(header.key_len) + header.value_len,
            |body| {
                let (key, value) = body.split_at(header.key_len as usize);
                record_checksum(key, value) == header.checksum && key_hash(key) == header.key_hash
            },
        )?;
        if !body_ok {
            return Err(PoolError::consistency(format!(
                "Record {} checksum mismatch",
                self.offset
            )));
        }
        Ok(header)
    }
}
