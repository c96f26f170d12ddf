//! The storage engine: composes the block device, the index table and the
//! record codec into load/save/remove by key, a key allocator, and offline
//! compaction (§4.D).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::config::OpenOptions;
use crate::codec;
use crate::entry::{Entry, Key, INVALID_KEY, ROOT_KEY};
use crate::error::{Error, Result};
use crate::storage::device::BlockDevice;
use crate::storage::index::{IndexRecord, IndexTable};

const LOG_DEVICE_SUFFIX: &str = "logd";
const LOG_DEVICE_COMPACTING_SUFFIX: &str = "logdc";
const INDEX_SUFFIX: &str = "index";

struct EngineState {
    device: Arc<BlockDevice>,
    index: IndexTable,
}

/// Composes the block device, index table and record codec per §4.D.
pub struct StorageEngine {
    dir: PathBuf,
    name: String,
    opts: OpenOptions,
    state: RwLock<Option<EngineState>>,
    key_counter: spin::Mutex<Key>,
}

fn storage_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{name}.{suffix}"))
}

impl StorageEngine {
    /// Opens (creating if needed) the engine's log device and index file,
    /// synthesizing the root entry on first open, then running offline
    /// compaction, per §4.D.1.
    #[instrument(skip(opts), level = "debug")]
    pub fn open(dir: impl AsRef<Path>, name: impl Into<String>, opts: OpenOptions) -> Result<Self> {
        opts.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let name = name.into();

        fs::create_dir_all(&dir).map_err(Error::from)?;

        let device = BlockDevice::open(storage_path(&dir, &name, LOG_DEVICE_SUFFIX), opts.block_size, opts.create_if_missing)?;

        let index_path = storage_path(&dir, &name, INDEX_SUFFIX);
        let (mut key_counter, mut index) = if index_path.exists() {
            let bytes = fs::read(&index_path).map_err(Error::from)?;
            let mut cursor = &bytes[..];
            let key_counter = read_u64(&mut cursor)?;
            let index = IndexTable::decode(&mut cursor)?;
            (key_counter, index)
        } else {
            (INVALID_KEY, IndexTable::new())
        };

        if index.is_empty() && device.size_in_blocks() > 0 {
            return Err(Error::fatal("broken storage"));
        }

        let device = Arc::new(device);

        let engine = StorageEngine {
            dir,
            name,
            opts,
            state: RwLock::new(None),
            key_counter: spin::Mutex::new(key_counter),
        };

        if index.find(ROOT_KEY).is_none() {
            *engine.key_counter.lock() = ROOT_KEY;
            let root_key = engine.new_key();
            debug_assert_eq!(root_key, ROOT_KEY);
            let root = Entry::root();
            let buf = codec::encode_entry_to_vec(&root).map_err(|e| Error::io(format!("unable to serialize root entry: {e}")))?;
            let (block, blocks) = device.append(&buf)?;
            debug_assert!(blocks >= 1);
            index.insert(IndexRecord { key: ROOT_KEY, block_index: block, byte_length: buf.len() as u32 });
        }

        *engine.state.write() = Some(EngineState { device, index });

        engine.compact_if_needed()?;

        Ok(engine)
    }

    /// Loads the entry stored under `key`.
    #[instrument(skip(self), level = "trace")]
    pub fn load(&self, key: Key) -> Result<Entry> {
        if key == INVALID_KEY {
            return Err(Error::invalid_argument("invalid entry id"));
        }

        let (device, record) = {
            let guard = self.state.read();
            let state = guard.as_ref().ok_or_else(|| Error::io("engine not opened"))?;
            let record = state.index.find(key).ok_or_else(|| Error::invalid_argument("key doesn't exist"))?;
            (Arc::clone(&state.device), record)
        };

        let buf = device.read(record.block_index, record.byte_length)?;
        codec::decode_entry_from_slice(&buf).map_err(|e| Error::fatal(format!("unable to deserialize entry {key}: {e}")))
    }

    /// Serializes and appends `entry`, upserting its index record.
    #[instrument(skip(self, entry), level = "trace")]
    pub fn save(&self, entry: &Entry) -> Result<()> {
        if entry.key() == INVALID_KEY {
            return Err(Error::invalid_argument("invalid entry id"));
        }

        let buf = codec::encode_entry_to_vec(entry).map_err(|e| Error::io(format!("unable to serialize entry: {e}")))?;
        if buf.len() > u32::MAX as usize {
            return Err(Error::io("entry too big"));
        }

        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| Error::io("engine not opened"))?;

        let (block, _blocks) = state.device.append(&buf)?;
        state.index.insert(IndexRecord { key: entry.key(), block_index: block, byte_length: buf.len() as u32 });

        Ok(())
    }

    /// Erases `key` from the index table. The on-disk bytes are left for
    /// compaction to reclaim later (§4.D.4).
    pub fn remove(&self, key: Key) -> Result<()> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| Error::io("engine not opened"))?;

        if state.index.erase(key).is_none() {
            return Err(Error::invalid_argument("key doesn't exist"));
        }
        Ok(())
    }

    /// Returns the next key from the monotonic counter.
    pub fn new_key(&self) -> Key {
        let mut counter = self.key_counter.lock();
        let key = *counter;
        *counter += 1;
        key
    }

    /// Placeholder for a future key-reclaim scheme; intentionally a no-op
    /// per §4.D.6 and §9.
    pub fn reuse_key(&self, _key: Key) {}

    pub fn is_opened(&self) -> bool {
        self.state.read().is_some()
    }

    /// Persists the index table and closes the device. Idempotent.
    #[instrument(skip(self), level = "debug")]
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        let Some(state) = guard.take() else {
            return Ok(());
        };

        let index_path = storage_path(&self.dir, &self.name, INDEX_SUFFIX);
        let mut buf = Vec::new();
        buf.extend_from_slice(&(*self.key_counter.lock()).to_le_bytes());
        state
            .index
            .encode(&mut buf)
            .map_err(|e| Error::io(format!("unable to serialize index table: {e}")))?;
        fs::write(&index_path, &buf).map_err(Error::from)?;

        state.device.close()?;

        Ok(())
    }

    /// Offline compaction (§4.D.5), run only at `open`.
    fn compact_if_needed(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| Error::io("engine not opened"))?;

        if state.device.size_in_bytes() < self.opts.compaction_device_min_size {
            return Ok(());
        }

        let footprint = state.index.block_footprint(self.opts.block_size);
        let total_blocks = u64::from(state.device.size_in_blocks());
        if total_blocks == 0 {
            return Ok(());
        }
        let ratio = footprint as f64 / total_blocks as f64;
        if ratio > self.opts.compaction_ratio {
            debug!(ratio, "skipping compaction: utilization already high enough");
            return Ok(());
        }

        debug!(ratio, "running offline compaction");

        let scratch_path = storage_path(&self.dir, &self.name, LOG_DEVICE_COMPACTING_SUFFIX);
        let _ = fs::remove_file(&scratch_path);

        let result = (|| -> Result<(BlockDevice, IndexTable)> {
            let scratch = BlockDevice::open(&scratch_path, self.opts.block_size, true)?;
            let mut compacted = IndexTable::new();

            for record in state.index.iter() {
                let bytes = state.device.read(record.block_index, record.byte_length)?;
                let (block, _) = scratch.append(&bytes)?;
                compacted.insert(IndexRecord { key: record.key, block_index: block, byte_length: record.byte_length });
            }

            Ok((scratch, compacted))
        })();

        let (scratch, compacted) = match result {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "compaction failed, discarding scratch device");
                let _ = fs::remove_file(&scratch_path);
                return Err(Error::io(format!("unable to compact device: {e}")));
            }
        };

        state.device.close()?;
        scratch.close()?;

        let live_path = storage_path(&self.dir, &self.name, LOG_DEVICE_SUFFIX);
        fs::remove_file(&live_path).map_err(Error::from)?;
        fs::rename(&scratch_path, &live_path).map_err(|e| Error::fatal(format!("unable to rename device: {e}")))?;

        let reopened = BlockDevice::open(&live_path, self.opts.block_size, false)?;
        state.device = Arc::new(reopened);
        state.index = compacted;

        Ok(())
    }
}

fn read_u64(r: &mut &[u8]) -> Result<u64> {
    if r.len() < 8 {
        return Err(Error::fatal("truncated index file"));
    }
    let (head, tail) = r.split_at(8);
    *r = tail;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}
