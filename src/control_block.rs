//! The in-memory entry cache: a control block per claimed entry, and the
//! table that claims/releases them with save-on-release semantics (§4.E).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entry::{Entry, Key};
use crate::error::Result;

/// Wraps one cached [`Entry`]: a read/write lock around the entry, a usage
/// (reference) count, and a dirty flag tracking mutation since last save.
pub struct ControlBlock {
    entry: RwLock<Entry>,
    usage: AtomicUsize,
    dirty: AtomicBool,
}

impl ControlBlock {
    fn new(entry: Entry, usage: usize) -> Self {
        ControlBlock {
            entry: RwLock::new(entry),
            usage: AtomicUsize::new(usage),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> Key {
        self.entry.read().key()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Entry> {
        self.entry.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entry> {
        self.entry.write()
    }

    /// Marks the block dirty. Callers invoke this after a mutation through
    /// [`ControlBlock::write`] actually succeeds (§4.E: the dirty flag is
    /// set "by any mutating call that succeeded").
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn acquire(&self) -> usize {
        self.usage.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn release_one(&self) -> usize {
        self.usage.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// Claims cached entries by key, loading misses through a caller-supplied
/// loader. Claim and release both run under the table's single lock, so a
/// load race -- two threads claiming the same absent key at once -- can
/// never load the same entry from the engine twice.
pub struct ControlBlockTable {
    blocks: RwLock<HashMap<Key, Arc<ControlBlock>>>,
}

impl ControlBlockTable {
    pub fn new() -> Self {
        ControlBlockTable { blocks: RwLock::new(HashMap::new()) }
    }

    /// Returns the control block for `key`, bumping its usage count. Loads
    /// it via `loader` first if it isn't already cached.
    pub fn claim<F>(&self, key: Key, loader: F) -> Result<Arc<ControlBlock>>
    where
        F: FnOnce() -> Result<Entry>,
    {
        {
            let blocks = self.blocks.read();
            if let Some(block) = blocks.get(&key) {
                block.acquire();
                return Ok(Arc::clone(block));
            }
        }

        let mut blocks = self.blocks.write();
        if let Some(block) = blocks.get(&key) {
            block.acquire();
            return Ok(Arc::clone(block));
        }

        let entry = loader()?;
        let block = Arc::new(ControlBlock::new(entry, 1));
        blocks.insert(key, Arc::clone(&block));
        Ok(block)
    }

    /// Releases one reference to `key`. Returns `Err(NotFound)` if `key`
    /// isn't claimed at all, `Ok(None)` if other claimants remain, or
    /// `Ok(Some(block))` when this was the last reference -- the block has
    /// already been dropped from the table and the caller is expected to
    /// flush it to storage first if it's dirty.
    pub fn release(&self, key: Key) -> Result<Option<Arc<ControlBlock>>> {
        let mut blocks = self.blocks.write();
        let block = blocks.get(&key).cloned().ok_or_else(|| crate::error::Error::invalid_argument("handle not open"))?;
        if block.release_one() == 0 {
            blocks.remove(&key);
            Ok(Some(block))
        } else {
            Ok(None)
        }
    }

    /// Returns the control block for `key` without claiming it, for callers
    /// that already hold an outstanding claim (e.g. an open handle).
    pub fn peek(&self, key: Key) -> Option<Arc<ControlBlock>> {
        self.blocks.read().get(&key).cloned()
    }

    pub fn is_open(&self, key: Key) -> bool {
        self.blocks.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl Default for ControlBlockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyValue;

    #[test]
    fn claim_loads_once_and_caches_on_second_claim() {
        let table = ControlBlockTable::new();
        let mut loads = 0;

        let block1 = table.claim(1, || {
            loads += 1;
            Ok(Entry::new(1, "a"))
        }).unwrap();
        assert_eq!(loads, 1);

        let block2 = table.claim(1, || {
            loads += 1;
            Ok(Entry::new(1, "a"))
        }).unwrap();
        assert_eq!(loads, 1);
        assert!(Arc::ptr_eq(&block1, &block2));
    }

    #[test]
    fn release_drops_from_table_only_at_zero_usage() {
        let table = ControlBlockTable::new();
        table.claim(1, || Ok(Entry::new(1, "a"))).unwrap();
        table.claim(1, || Ok(Entry::new(1, "a"))).unwrap();

        assert!(table.release(1).unwrap().is_none());
        assert_eq!(table.len(), 1);

        let released = table.release(1).unwrap().unwrap();
        assert!(table.is_empty());
        assert_eq!(released.key(), 1);
    }

    #[test]
    fn release_of_unclaimed_key_is_an_error() {
        let table = ControlBlockTable::new();
        assert!(table.release(99).is_err());
    }

    #[test]
    fn write_does_not_dirty_without_explicit_mark() {
        let table = ControlBlockTable::new();
        let block = table.claim(1, || Ok(Entry::new(1, "a"))).unwrap();
        assert!(!block.is_dirty());

        let _ = block.read();
        assert!(!block.is_dirty());

        block.write().set_property("p", PropertyValue::U8(1));
        assert!(!block.is_dirty());

        block.mark_dirty();
        assert!(block.is_dirty());

        block.clear_dirty();
        assert!(!block.is_dirty());
    }
}
