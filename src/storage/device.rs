//! The append-only block device: a single file treated as a sequence of
//! fixed-size blocks, with one write handle and a small pool of read
//! handles sharded by the calling thread's id (§4.A).

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::instrument;

use crate::error::{Error, Result};

/// Number of concurrent reader file handles kept in the pool, matching the
/// original `LogDevice`'s fixed `N_READERS` convention.
pub const READER_POOL_SIZE: usize = 17;

struct ReaderSlot {
    file: Mutex<Option<File>>,
}

/// An append-only log over a single file.
pub struct BlockDevice {
    path: PathBuf,
    block_size: u32,
    write_handle: Mutex<Option<File>>,
    readers: Vec<ReaderSlot>,
    block_count: AtomicU32,
    opened: AtomicBool,
}

impl BlockDevice {
    /// Opens (or creates) the device at `path`. On reopen, `block_count =
    /// file_size / block_size`; a non-block-aligned file size is a
    /// malformed-file error.
    #[instrument(skip(path), level = "debug")]
    pub fn open(path: impl AsRef<Path>, block_size: u32, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if block_size == 0 || block_size % 512 != 0 {
            return Err(Error::invalid_argument(format!(
                "block_size must be a non-zero multiple of 512, got {block_size}"
            )));
        }

        let exists = path.exists();
        if !exists && !create_if_missing {
            return Err(Error::io(format!("device file does not exist: {}", path.display())));
        }

        let write_handle = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(&path)
            .map_err(|e| Error::io(format!("unable to open device at {}: {e}", path.display())))?;

        let file_size = write_handle.metadata().map_err(Error::from)?.len();
        if file_size % u64::from(block_size) != 0 {
            return Err(Error::fatal(format!(
                "device file {} has a non-block-aligned size ({} bytes, block_size {})",
                path.display(),
                file_size,
                block_size
            )));
        }
        let block_count = (file_size / u64::from(block_size)) as u32;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let f = File::open(&path).map_err(|e| Error::io(format!("unable to open reader handle: {e}")))?;
            readers.push(ReaderSlot { file: Mutex::new(Some(f)) });
        }

        Ok(BlockDevice {
            path,
            block_size,
            write_handle: Mutex::new(Some(write_handle)),
            readers,
            block_count: AtomicU32::new(block_count),
            opened: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn size_in_blocks(&self) -> u32 {
        self.block_count.load(Ordering::Acquire)
    }

    pub fn size_in_bytes(&self) -> u64 {
        u64::from(self.size_in_blocks()) * u64::from(self.block_size)
    }

    /// Appends `buffer`, zero-padding it up to a whole number of blocks,
    /// flushing before returning `(starting_block_index, blocks_written)`.
    #[instrument(skip(self, buffer), level = "trace")]
    pub fn append(&self, buffer: &[u8]) -> Result<(u32, u32)> {
        if buffer.is_empty() {
            return Err(Error::invalid_argument("unable to write an empty buffer"));
        }
        if !self.is_opened() {
            return Err(Error::io("device not opened"));
        }

        let mut guard = self.write_handle.lock();
        let file = guard.as_mut().ok_or_else(|| Error::io("device not opened"))?;

        let start_offset = file.seek(SeekFrom::End(0)).map_err(Error::from)?;
        file.write_all(buffer).map_err(Error::from)?;

        let remainder = buffer.len() % self.block_size as usize;
        if remainder != 0 {
            let pad = self.block_size as usize - remainder;
            let zeros = vec![0u8; pad];
            file.write_all(&zeros).map_err(Error::from)?;
        }
        file.flush().map_err(Error::from)?;
        file.sync_all().map_err(Error::from)?;

        let end_offset = file.stream_position().map_err(Error::from)?;
        let blocks_written = ((end_offset - start_offset) / u64::from(self.block_size)) as u32;
        self.block_count.fetch_add(blocks_written, Ordering::AcqRel);

        Ok(((start_offset / u64::from(self.block_size)) as u32, blocks_written))
    }

    /// Reads exactly `byte_count` bytes starting at `block_index`, using a
    /// reader handle selected by hashing the calling thread's id modulo the
    /// pool size (§4.A, §9 design note).
    #[instrument(skip(self), level = "trace")]
    pub fn read(&self, block_index: u32, byte_count: u32) -> Result<Vec<u8>> {
        if !self.is_opened() {
            return Err(Error::io("device not opened"));
        }

        let blocks_needed = (u64::from(byte_count) + u64::from(self.block_size) - 1) / u64::from(self.block_size);
        let total_blocks = u64::from(self.size_in_blocks());
        if u64::from(block_index) + blocks_needed > total_blocks {
            return Err(Error::invalid_argument("read past end of device"));
        }

        let slot_index = thread_slot_index();
        let slot = &self.readers[slot_index];
        let mut guard = slot.file.lock();
        let file = guard.as_mut().ok_or_else(|| Error::io("device not opened"))?;

        file.seek(SeekFrom::Start(u64::from(block_index) * u64::from(self.block_size))).map_err(Error::from)?;
        let mut data = vec![0u8; byte_count as usize];
        file.read_exact(&mut data).map_err(Error::from)?;

        Ok(data)
    }

    /// Drops all handles and clears state. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.opened.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        *self.write_handle.lock() = None;
        for slot in &self.readers {
            *slot.file.lock() = None;
        }
        Ok(())
    }
}

fn thread_slot_index() -> usize {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() % READER_POOL_SIZE as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn append_always_yields_whole_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let device = BlockDevice::open(dir.path().join("test.logd"), 512, true).unwrap();

        let (start, blocks) = device.append(b"hello").unwrap();
        assert_eq!(start, 0);
        assert_eq!(blocks, 1);
        assert_eq!(device.size_in_blocks(), 1);

        let (start2, blocks2) = device.append(&vec![7u8; 1000]).unwrap();
        assert_eq!(start2, 1);
        assert_eq!(blocks2, 2);
    }

    #[test]
    fn read_returns_exactly_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let device = BlockDevice::open(dir.path().join("test.logd"), 512, true).unwrap();

        let payload = b"exact bytes written to the log";
        let (start, _) = device.append(payload).unwrap();

        let read_back = device.read(start, payload.len() as u32).unwrap();
        assert_eq!(&read_back[..], &payload[..]);
    }

    #[test]
    fn read_past_end_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let device = BlockDevice::open(dir.path().join("test.logd"), 512, true).unwrap();
        device.append(b"x").unwrap();

        let err = device.read(5, 512).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let device = BlockDevice::open(dir.path().join("test.logd"), 512, true).unwrap();
        assert!(device.close().is_ok());
        assert!(device.close().is_ok());
    }

    #[test]
    fn reopen_detects_misaligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.logd");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let err = BlockDevice::open(&path, 512, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn seventeen_concurrent_readers_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(BlockDevice::open(dir.path().join("test.logd"), 512, true).unwrap());

        let mut blocks = Vec::new();
        for i in 0..34u8 {
            let (start, _) = device.append(&vec![i; 512]).unwrap();
            blocks.push((start, i));
        }

        let mut handles = Vec::new();
        for _ in 0..READER_POOL_SIZE {
            let device = Arc::clone(&device);
            let blocks = blocks.clone();
            handles.push(std::thread::spawn(move || {
                for (start, expected) in &blocks {
                    let data = device.read(*start, 512).unwrap();
                    assert!(data.iter().all(|&b| b == *expected));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
