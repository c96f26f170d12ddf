//! The ordered in-memory index: `key -> (block_index, byte_length)`, and
//! its bit-exact on-disk representation, per §4.B / §6.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::entry::Key;
use crate::error::{Error, Result};

/// A single index entry: where a record's bytes live on the log device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: Key,
    pub block_index: u32,
    pub byte_length: u32,
}

/// Ordered `key -> IndexRecord` mapping. Ordering is by key, which both
/// enables ascending-key iteration during compaction and makes
/// serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTable {
    records: BTreeMap<Key, IndexRecord>,
}

impl IndexTable {
    pub fn new() -> Self {
        IndexTable::default()
    }

    pub fn find(&self, key: Key) -> Option<IndexRecord> {
        self.records.get(&key).copied()
    }

    pub fn insert(&mut self, record: IndexRecord) {
        self.records.insert(record.key, record);
    }

    pub fn erase(&mut self, key: Key) -> Option<IndexRecord> {
        self.records.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexRecord> {
        self.records.values()
    }

    /// Summed blocks occupied by every live record, used by the compactor
    /// to estimate current utilization (§4.B, §4.D.5).
    pub fn block_footprint(&self, block_size: u32) -> u64 {
        self.records
            .values()
            .map(|r| {
                let bs = u64::from(block_size);
                (u64::from(r.byte_length) + bs - 1) / bs
            })
            .sum()
    }

    /// Serializes as `count: u64` followed by `count` records of
    /// `(key: u64, block_index: u32, byte_length: u32)`, little-endian.
    pub fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&(self.records.len() as u64).to_le_bytes())?;
        for record in self.records.values() {
            w.write_all(&record.key.to_le_bytes())?;
            w.write_all(&record.block_index.to_le_bytes())?;
            w.write_all(&record.byte_length.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let count = read_u64(r)?;
        let mut table = IndexTable::new();
        for _ in 0..count {
            let key = read_u64(r)?;
            let block_index = read_u32(r)?;
            let byte_length = read_u32(r)?;
            table.insert(IndexRecord { key, block_index, byte_length });
        }
        Ok(table)
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut table = IndexTable::new();
        table.insert(IndexRecord { key: 1, block_index: 0, byte_length: 100 });
        table.insert(IndexRecord { key: 5, block_index: 2, byte_length: 40 });

        let mut buf = Vec::new();
        table.encode(&mut buf).unwrap();
        let decoded = IndexTable::decode(&mut &buf[..]).unwrap();

        assert_eq!(table, decoded);
    }

    #[test]
    fn block_footprint_rounds_up() {
        let mut table = IndexTable::new();
        table.insert(IndexRecord { key: 1, block_index: 0, byte_length: 1 });
        table.insert(IndexRecord { key: 2, block_index: 1, byte_length: 513 });

        assert_eq!(table.block_footprint(512), 1 + 2);
    }
}
