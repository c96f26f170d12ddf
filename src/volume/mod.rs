//! A volume: one storage engine, its control-block cache, its path cache,
//! and path resolution over the entry tree it persists (§4.G).

mod path;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path as FsPath;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;

use crate::config::OpenOptions;
use crate::control_block::{ControlBlock, ControlBlockTable};
use crate::entry::{Entry, Key, ROOT_KEY};
use crate::error::{Error, Result};
use crate::path_cache::PathCache;
use crate::property::PropertyValue;
use crate::storage::StorageEngine;

pub use path::{join, segments, simplify};

/// Identifies an external owner of a volume's claim (§4.G.5). Any stable
/// non-zero value works; callers typically use a pointer cast to their own
/// handle object.
pub type ClaimToken = NonZeroUsize;

struct ClaimState {
    token: ClaimToken,
    count: usize,
}

/// One entry tree, persisted through a [`StorageEngine`], with a bounded
/// path cache and a control-block cache in front of it. A handle at this
/// layer is simply the resolved entry's key.
pub struct Volume {
    engine: StorageEngine,
    control_blocks: ControlBlockTable,
    path_cache: PathCache,
    claim: Mutex<Option<ClaimState>>,
}

impl Volume {
    #[instrument(skip(opts), level = "debug")]
    pub fn open(dir: impl AsRef<FsPath>, name: impl Into<String>, opts: OpenOptions) -> Result<Self> {
        let engine = StorageEngine::open(dir, name, opts)?;
        Ok(Volume {
            engine,
            control_blocks: ControlBlockTable::new(),
            path_cache: PathCache::default(),
            claim: Mutex::new(None),
        })
    }

    fn peek_block(&self, handle: Key) -> Result<Arc<ControlBlock>> {
        self.control_blocks.peek(handle).ok_or_else(|| Error::invalid_argument("handle not open"))
    }

    fn children_of(&self, key: Key) -> Result<BTreeMap<String, Key>> {
        if let Some(block) = self.control_blocks.peek(key) {
            return Ok(block.read().children().iter().map(|(n, k)| (n.to_string(), k)).collect());
        }
        Ok(self.engine.load(key)?.children().iter().map(|(n, k)| (n.to_string(), k)).collect())
    }

    /// Resolves a path to an entry key without claiming its control block
    /// (§4.G.1). Probes the path cache at successive prefixes of the
    /// simplified path from longest to shortest, then walks the remaining
    /// segments against the live tree, re-populating the cache as it goes.
    /// Cache hits are advisory: every hop is still checked against the
    /// parent's current children.
    fn resolve(&self, path: &str) -> Result<Key> {
        let simplified = path::simplify(path);
        let segments = path::segments(&simplified);

        let mut current_key = ROOT_KEY;
        let mut tracked = "/".to_string();
        let mut start = 0;
        let mut hit = false;

        for i in (0..=segments.len()).rev() {
            let candidate = path::join(&segments, i);
            if let Some(key) = self.path_cache.lookup(&candidate) {
                current_key = key;
                tracked = candidate;
                start = i;
                hit = true;
                break;
            }
        }
        if !hit {
            self.path_cache.insert("/", ROOT_KEY);
        }

        for segment in &segments[start..] {
            let children = self.children_of(current_key)?;
            let child_key = *children
                .get(*segment)
                .ok_or_else(|| Error::not_found(format!("no such entry: {segment}")))?;
            current_key = child_key;
            tracked = if tracked == "/" { format!("/{segment}") } else { format!("{tracked}/{segment}") };
            self.path_cache.insert(tracked.clone(), current_key);
        }

        Ok(current_key)
    }

    /// Resolves `path` and claims its control block, returning the key as
    /// the handle.
    #[instrument(skip(self), level = "trace")]
    pub fn open_path(&self, path: &str) -> Result<Key> {
        let key = self.resolve(path)?;
        self.control_blocks.claim(key, || self.engine.load(key))?;
        Ok(key)
    }

    /// Releases `handle`'s control block. If it was the last reference and
    /// the block is dirty, saves it through the engine first.
    pub fn close(&self, handle: Key) -> Result<()> {
        if let Some(block) = self.control_blocks.release(handle)? {
            if block.is_dirty() {
                self.engine.save(&block.read())?;
            }
        }
        Ok(())
    }

    pub fn properties(&self, handle: Key) -> Result<BTreeMap<String, PropertyValue>> {
        Ok(self.peek_block(handle)?.read().properties())
    }

    pub fn property(&self, handle: Key, name: &str) -> Result<PropertyValue> {
        self.peek_block(handle)?.read().property(name)
    }

    pub fn has_property(&self, handle: Key, name: &str) -> Result<bool> {
        Ok(self.peek_block(handle)?.read().has_property(name))
    }

    pub fn properties_names(&self, handle: Key) -> Result<Vec<String>> {
        Ok(self.peek_block(handle)?.read().properties_names())
    }

    pub fn set_property(&self, handle: Key, name: impl Into<String>, value: PropertyValue) -> Result<()> {
        let block = self.peek_block(handle)?;
        block.write().set_property(name, value);
        block.mark_dirty();
        Ok(())
    }

    pub fn remove_property(&self, handle: Key, name: &str) -> Result<()> {
        let block = self.peek_block(handle)?;
        let result = block.write().remove_property(name);
        if result.is_ok() {
            block.mark_dirty();
        }
        result
    }

    pub fn expire_property(&self, handle: Key, name: &str, deadline_millis: i64) -> Result<()> {
        let block = self.peek_block(handle)?;
        let result = block.write().expire_property(name, deadline_millis);
        if result.is_ok() {
            block.mark_dirty();
        }
        result
    }

    pub fn cancel_expiration(&self, handle: Key, name: &str) -> Result<()> {
        let block = self.peek_block(handle)?;
        block.write().cancel_expiration(name);
        block.mark_dirty();
        Ok(())
    }

    pub fn children(&self, handle: Key) -> Result<Vec<(String, Key)>> {
        let block = self.peek_block(handle)?;
        let entry = block.read();
        Ok(entry.children().iter().map(|(n, k)| (n.to_string(), k)).collect())
    }

    /// Allocates a new child entry named `name` under `parent_handle`.
    /// Rolls the child back out of the parent if the subsequent save fails.
    #[instrument(skip(self), level = "trace")]
    pub fn link(&self, parent_handle: Key, name: &str) -> Result<Key> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::invalid_argument("child name must be non-empty and contain no '/'"));
        }

        let parent_block = self.peek_block(parent_handle)?;
        if parent_block.read().children().get(name).is_some() {
            return Err(Error::invalid_argument("a child with that name already exists"));
        }

        let child_key = self.engine.new_key();
        let mut child = Entry::new(child_key, name);
        parent_block.write().add_child(&mut child)?;

        if let Err(e) = self.engine.save(&child) {
            let mut parent = parent_block.write();
            let _ = parent.remove_child(&mut child);
            return Err(e);
        }
        parent_block.mark_dirty();

        Ok(child_key)
    }

    /// Removes `name` from `parent_handle`'s children. Rejects a child that
    /// is currently open (non-zero control-block usage) or that has
    /// children of its own on disk.
    #[instrument(skip(self), level = "trace")]
    pub fn unlink(&self, parent_handle: Key, name: &str) -> Result<()> {
        let parent_block = self.peek_block(parent_handle)?;
        let child_key = parent_block
            .read()
            .children()
            .get(name)
            .ok_or_else(|| Error::not_found("no such child"))?;

        if self.control_blocks.is_open(child_key) {
            return Err(Error::invalid_operation("child entry is currently open"));
        }

        let mut child_entry = self.engine.load(child_key)?;
        if !child_entry.children().is_empty() {
            return Err(Error::invalid_argument("child entry has children"));
        }

        parent_block.write().remove_child(&mut child_entry)?;
        parent_block.mark_dirty();

        self.engine.remove(child_key)?;
        Ok(())
    }

    /// Claims the volume for `token` (§4.G.5). Repeated claims by the same
    /// token increment a reference count; a different token is rejected
    /// while the volume is held.
    pub fn claim(&self, token: ClaimToken) -> Result<()> {
        let mut state = self.claim.lock();
        match state.as_mut() {
            Some(existing) if existing.token == token => {
                existing.count += 1;
                Ok(())
            }
            Some(_) => Err(Error::invalid_operation("volume is claimed by a different owner")),
            None => {
                *state = Some(ClaimState { token, count: 1 });
                Ok(())
            }
        }
    }

    pub fn release_claim(&self, token: ClaimToken) -> Result<()> {
        let mut state = self.claim.lock();
        match state.as_mut() {
            Some(existing) if existing.token == token => {
                existing.count -= 1;
                if existing.count == 0 {
                    *state = None;
                }
                Ok(())
            }
            _ => Err(Error::invalid_operation("token does not hold a claim on this volume")),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.lock().is_some()
    }

    /// Closes the underlying engine. Fails if the volume is still claimed.
    pub fn shutdown(&self) -> Result<()> {
        if self.is_claimed() {
            return Err(Error::invalid_operation("volume is still claimed"));
        }
        self.engine.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_volume(dir: &FsPath) -> Volume {
        Volume::open(dir, "vol", OpenOptions::default()).unwrap()
    }

    fn token(n: usize) -> ClaimToken {
        ClaimToken::new(n).unwrap()
    }

    #[test]
    fn open_root_then_set_and_read_a_property() {
        let dir = tempfile::tempdir().unwrap();
        let volume = open_volume(dir.path());

        let root = volume.open_path("/").unwrap();
        assert_eq!(root, ROOT_KEY);

        volume.set_property(root, "greeting", PropertyValue::String("hi".into())).unwrap();
        assert_eq!(volume.property(root, "greeting").unwrap(), PropertyValue::String("hi".into()));
        volume.close(root).unwrap();
    }

    #[test]
    fn link_then_resolve_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let volume = open_volume(dir.path());

        let root = volume.open_path("/").unwrap();
        let proc_key = volume.link(root, "proc").unwrap();
        volume.close(root).unwrap();

        let proc_handle = volume.open_path("/proc").unwrap();
        assert_eq!(proc_handle, proc_key);

        let self_key = volume.link(proc_handle, "self").unwrap();
        volume.close(proc_handle).unwrap();

        let self_handle = volume.open_path("/proc/self").unwrap();
        assert_eq!(self_handle, self_key);
        volume.close(self_handle).unwrap();
    }

    #[test]
    fn resolving_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let volume = open_volume(dir.path());
        let err = volume.open_path("/nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn unlink_requires_empty_and_closed_child() {
        let dir = tempfile::tempdir().unwrap();
        let volume = open_volume(dir.path());

        let root = volume.open_path("/").unwrap();
        let dev_key = volume.link(root, "dev").unwrap();

        let dev_handle = volume.open_path("/dev").unwrap();
        assert_eq!(dev_handle, dev_key);
        assert!(volume.unlink(root, "dev").is_err());

        volume.close(dev_handle).unwrap();
        volume.unlink(root, "dev").unwrap();

        assert!(volume.open_path("/dev").is_err());
        volume.close(root).unwrap();
    }

    #[test]
    fn duplicate_link_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let volume = open_volume(dir.path());
        let root = volume.open_path("/").unwrap();
        volume.link(root, "a").unwrap();
        assert!(volume.link(root, "a").is_err());
        volume.close(root).unwrap();
    }

    #[test]
    fn claim_token_blocks_other_owners_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let volume = open_volume(dir.path());

        volume.claim(token(1)).unwrap();
        volume.claim(token(1)).unwrap();
        assert!(volume.claim(token(2)).is_err());

        assert!(volume.shutdown().is_err());

        volume.release_claim(token(1)).unwrap();
        assert!(volume.is_claimed());
        volume.release_claim(token(1)).unwrap();
        assert!(!volume.is_claimed());

        volume.shutdown().unwrap();
    }

    #[test]
    fn properties_and_links_survive_close_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let volume = open_volume(dir.path());
            let root = volume.open_path("/").unwrap();
            volume.set_property(root, "i", PropertyValue::U32(7)).unwrap();
            volume.link(root, "dev").unwrap();
            volume.close(root).unwrap();
            volume.shutdown().unwrap();
        }
        {
            let volume = open_volume(dir.path());
            let root = volume.open_path("/").unwrap();
            assert_eq!(volume.property(root, "i").unwrap(), PropertyValue::U32(7));
            volume.close(root).unwrap();

            let dev = volume.open_path("/dev").unwrap();
            volume.close(dev).unwrap();
        }
    }
}
