//! The virtual storage overlay: a mount table of `(mount_path, entry_path,
//! volume, priority)` entries, and priority-ordered fan-out of operations
//! across whichever volumes back a given virtual handle (§4.H).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::instrument;

use crate::entry::{Key, ROOT_KEY};
use crate::error::{Error, Result};
use crate::property::PropertyValue;
use crate::volume::{join, segments, simplify, ClaimToken, Volume};

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

/// Fan-out priority. A signed newtype mirroring the original
/// `Storage::MaxPriority` / `DefaultPriority` / `MinPriority` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const MAX: Priority = Priority(i32::MAX);
    pub const DEFAULT: Priority = Priority(0);
    pub const MIN: Priority = Priority(i32::MIN);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

#[derive(Clone)]
struct MountEntry {
    mount_path: String,
    entry_path: String,
    volume: Arc<Volume>,
    handle: Key,
    priority: Priority,
}

#[derive(Clone)]
struct VirtualEntry {
    volume: Arc<Volume>,
    handle: Key,
    priority: Priority,
}

/// Owns a mount table and a table of open virtual handles, each indexing a
/// priority-ordered list of `(volume, volume-handle)` pairs.
pub struct VirtualStorage {
    runtime: tokio::runtime::Runtime,
    token: ClaimToken,
    mounts: RwLock<Vec<MountEntry>>,
    handles: RwLock<HashMap<Key, Vec<VirtualEntry>>>,
    next_handle: AtomicU64,
}

fn combine_any<F>(entries: &[VirtualEntry], op: F) -> Result<()>
where
    F: Fn(&VirtualEntry) -> Result<()>,
{
    let mut any_ok = false;
    let mut last_err = None;
    for entry in entries {
        match op(entry) {
            Ok(()) => any_ok = true,
            Err(e) => last_err = Some(e),
        }
    }
    if any_ok {
        Ok(())
    } else {
        Err(last_err.unwrap_or_else(|| Error::invalid_operation("no underlying volume succeeded")))
    }
}

impl VirtualStorage {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::fatal(format!("unable to start fan-out runtime: {e}")))?;

        let token_id = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let token = ClaimToken::new(token_id).expect("token counter starts at 1 and only increases");

        Ok(VirtualStorage {
            runtime,
            token,
            mounts: RwLock::new(Vec::new()),
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(ROOT_KEY + 1),
        })
    }

    fn longest_mount_prefix(mounts: &[MountEntry], simplified: &str) -> Option<String> {
        let segs = segments(simplified);
        for i in (0..=segs.len()).rev() {
            let candidate = join(&segs, i);
            if mounts.iter().any(|m| m.mount_path == candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Mounts `volume` at `mount_path`, backed by `entry_path` on that
    /// volume. Claims the volume (this storage is the claim token) and
    /// opens `entry_path` to validate it exists, keeping that handle open
    /// for the lifetime of the mount.
    #[instrument(skip(self, volume), level = "debug")]
    pub fn mount(&self, volume: Arc<Volume>, entry_path: &str, mount_path: &str, priority: Priority) -> Result<()> {
        let mount_path = simplify(mount_path);
        let entry_path = simplify(entry_path);

        volume.claim(self.token)?;

        {
            let mounts = self.mounts.read();
            let duplicate = mounts
                .iter()
                .any(|m| m.mount_path == mount_path && m.entry_path == entry_path && Arc::ptr_eq(&m.volume, &volume));
            if duplicate {
                let _ = volume.release_claim(self.token);
                return Err(Error::invalid_argument("duplicate mount"));
            }
        }

        let handle = match volume.open_path(&entry_path) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = volume.release_claim(self.token);
                return Err(e);
            }
        };

        self.mounts.write().push(MountEntry { mount_path, entry_path, volume, handle, priority });
        Ok(())
    }

    /// Unmounts the entry matching `(volume, entry_path, mount_path)`:
    /// closes the kept-open handle, releases the claim, and erases the
    /// mount entry.
    #[instrument(skip(self, volume), level = "debug")]
    pub fn unmount(&self, volume: &Arc<Volume>, entry_path: &str, mount_path: &str) -> Result<()> {
        let mount_path = simplify(mount_path);
        let entry_path = simplify(entry_path);

        let removed = {
            let mut mounts = self.mounts.write();
            let idx = mounts
                .iter()
                .position(|m| m.mount_path == mount_path && m.entry_path == entry_path && Arc::ptr_eq(&m.volume, volume))
                .ok_or_else(|| Error::not_found("no such mount"))?;
            mounts.remove(idx)
        };

        let _ = removed.volume.close(removed.handle);
        removed.volume.release_claim(self.token)?;
        Ok(())
    }

    fn entries_of(&self, handle: Key) -> Result<Vec<VirtualEntry>> {
        self.handles.read().get(&handle).cloned().ok_or_else(|| Error::invalid_argument("handle not open"))
    }

    /// Opens `vpath`: finds the longest registered mount path that prefixes
    /// it, fans `volume.open` out across every mount at that path (in
    /// parallel, via `spawn_blocking`), and keeps whichever succeed as a
    /// priority-ordered (highest first) virtual handle.
    #[instrument(skip(self), level = "debug")]
    pub fn open(&self, vpath: &str) -> Result<Key> {
        let simplified = simplify(vpath);

        let (matched, candidates) = {
            let mounts = self.mounts.read();
            let matched = Self::longest_mount_prefix(&mounts, &simplified)
                .ok_or_else(|| Error::invalid_argument("no such path"))?;
            let candidates: Vec<MountEntry> = mounts.iter().filter(|m| m.mount_path == matched).cloned().collect();
            (matched, candidates)
        };

        let remainder = simplified.strip_prefix(&matched).unwrap_or("").trim_start_matches('/').to_string();

        let results: Vec<Result<VirtualEntry>> = self.runtime.block_on(async {
            let tasks = candidates.into_iter().map(|mount| {
                let remainder = remainder.clone();
                tokio::task::spawn_blocking(move || {
                    let sub_path = if remainder.is_empty() {
                        mount.entry_path.clone()
                    } else {
                        format!("{}/{}", mount.entry_path, remainder)
                    };
                    let sub_path = simplify(&sub_path);
                    mount.volume.open_path(&sub_path).map(|handle| VirtualEntry {
                        volume: Arc::clone(&mount.volume),
                        handle,
                        priority: mount.priority,
                    })
                })
            });
            join_all(tasks)
                .await
                .into_iter()
                .map(|joined| joined.unwrap_or_else(|e| Err(Error::fatal(format!("fan-out task panicked: {e}")))))
                .collect()
        });

        let mut entries: Vec<VirtualEntry> = results.into_iter().filter_map(Result::ok).collect();
        if entries.is_empty() {
            return Err(Error::invalid_argument("no such path"));
        }
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));

        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        self.handles.write().insert(handle, entries);
        Ok(handle)
    }

    /// Closes a virtual handle. Requires every underlying volume to close
    /// successfully.
    pub fn close(&self, handle: Key) -> Result<()> {
        let entries = self.handles.write().remove(&handle).ok_or_else(|| Error::invalid_argument("handle not open"))?;
        let mut all_ok = true;
        for entry in &entries {
            if entry.volume.close(entry.handle).is_err() {
                all_ok = false;
            }
        }
        if all_ok {
            Ok(())
        } else {
            Err(Error::invalid_operation("not every underlying volume closed successfully"))
        }
    }

    /// Union across volumes; on a name conflict the highest-priority
    /// volume's value wins (entries are already priority-ordered, so the
    /// first writer for each name wins). Any per-volume failure fails the
    /// whole operation.
    pub fn properties(&self, handle: Key) -> Result<BTreeMap<String, PropertyValue>> {
        let entries = self.entries_of(handle)?;
        let mut result = BTreeMap::new();
        for entry in &entries {
            for (name, value) in entry.volume.properties(entry.handle)? {
                result.entry(name).or_insert(value);
            }
        }
        Ok(result)
    }

    /// First success: the highest-priority volume that has `name`.
    pub fn property(&self, handle: Key, name: &str) -> Result<PropertyValue> {
        let entries = self.entries_of(handle)?;
        for entry in &entries {
            if let Ok(value) = entry.volume.property(entry.handle, name) {
                return Ok(value);
            }
        }
        Err(Error::not_found(format!("no such property: {name}")))
    }

    /// Union across volumes; on a name conflict the highest-priority
    /// volume's entry wins. Any per-volume failure fails the whole
    /// operation -- same combiner as [`VirtualStorage::properties`].
    pub fn properties_names(&self, handle: Key) -> Result<Vec<String>> {
        let entries = self.entries_of(handle)?;
        let mut seen = BTreeSet::new();
        for entry in &entries {
            for name in entry.volume.properties_names(entry.handle)? {
                seen.insert(name);
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Applies to all; succeeds only if every volume succeeds. Every entry
    /// is attempted regardless of earlier failures, then the results are
    /// combined -- matching the fan-out/join-then-combine shape used
    /// throughout this overlay rather than short-circuiting on the first
    /// error.
    pub fn set_property(&self, handle: Key, name: &str, value: PropertyValue) -> Result<()> {
        let entries = self.entries_of(handle)?;
        let results: Vec<Result<()>> = entries.iter().map(|entry| entry.volume.set_property(entry.handle, name, value.clone())).collect();
        results.into_iter().collect()
    }

    /// Applies to all; succeeds if at least one volume succeeds.
    pub fn remove_property(&self, handle: Key, name: &str) -> Result<()> {
        let entries = self.entries_of(handle)?;
        combine_any(&entries, |entry| entry.volume.remove_property(entry.handle, name))
    }

    /// OR across volumes; fails if any volume errors.
    pub fn has_property(&self, handle: Key, name: &str) -> Result<bool> {
        let entries = self.entries_of(handle)?;
        let mut any = false;
        for entry in &entries {
            any |= entry.volume.has_property(entry.handle, name)?;
        }
        Ok(any)
    }

    /// Applies to all; succeeds if at least one volume succeeds.
    pub fn expire_property(&self, handle: Key, name: &str, deadline_millis: i64) -> Result<()> {
        let entries = self.entries_of(handle)?;
        combine_any(&entries, |entry| entry.volume.expire_property(entry.handle, name, deadline_millis))
    }

    /// Applies to all; succeeds if at least one volume succeeds.
    pub fn cancel_expiration(&self, handle: Key, name: &str) -> Result<()> {
        let entries = self.entries_of(handle)?;
        combine_any(&entries, |entry| {
            entry.volume.cancel_expiration(entry.handle, name)
        })
    }

    /// Applies to all; succeeds if at least one volume succeeds.
    pub fn link(&self, handle: Key, name: &str) -> Result<()> {
        let entries = self.entries_of(handle)?;
        combine_any(&entries, |entry| entry.volume.link(entry.handle, name).map(|_| ()))
    }

    /// Applies to all; succeeds if at least one volume succeeds.
    pub fn unlink(&self, handle: Key, name: &str) -> Result<()> {
        let entries = self.entries_of(handle)?;
        combine_any(&entries, |entry| entry.volume.unlink(entry.handle, name))
    }

    /// Union across volumes, keeping the highest-priority volume's key for
    /// a name that appears in more than one. Per-volume failure fails the
    /// whole operation.
    pub fn children(&self, handle: Key) -> Result<Vec<(String, Key)>> {
        let entries = self.entries_of(handle)?;
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for entry in &entries {
            for (name, key) in entry.volume.children(entry.handle)? {
                if seen.insert(name.clone()) {
                    result.push((name, key));
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenOptions;

    fn volume(dir: &std::path::Path, name: &str) -> Arc<Volume> {
        Arc::new(Volume::open(dir, name, OpenOptions::default()).unwrap())
    }

    #[test]
    fn mount_and_open_resolves_through_to_underlying_volume() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume(dir.path(), "a");
        let root = vol.open_path("/").unwrap();
        vol.set_property(root, "greeting", PropertyValue::String("hi".into())).unwrap();
        vol.close(root).unwrap();

        let overlay = VirtualStorage::new().unwrap();
        overlay.mount(Arc::clone(&vol), "/", "/mnt", Priority::DEFAULT).unwrap();

        let handle = overlay.open("/mnt").unwrap();
        assert_eq!(overlay.property(handle, "greeting").unwrap(), PropertyValue::String("hi".into()));
        overlay.close(handle).unwrap();
    }

    #[test]
    fn priority_breaks_ties_across_two_volumes() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let vol_a = volume(dir_a.path(), "a");
        let vol_b = volume(dir_b.path(), "b");

        let root_a = vol_a.open_path("/").unwrap();
        vol_a.set_property(root_a, "p", PropertyValue::U32(1)).unwrap();
        vol_a.close(root_a).unwrap();

        let root_b = vol_b.open_path("/").unwrap();
        vol_b.set_property(root_b, "p", PropertyValue::U32(2)).unwrap();
        vol_b.close(root_b).unwrap();

        let overlay = VirtualStorage::new().unwrap();
        overlay.mount(Arc::clone(&vol_a), "/", "/proc", Priority::MAX).unwrap();
        overlay.mount(Arc::clone(&vol_b), "/", "/proc", Priority::DEFAULT).unwrap();

        let handle = overlay.open("/proc").unwrap();
        assert_eq!(overlay.property(handle, "p").unwrap(), PropertyValue::U32(1));

        let props = overlay.properties(handle).unwrap();
        assert_eq!(props.get("p"), Some(&PropertyValue::U32(1)));
        assert_eq!(props.len(), 1);

        overlay.close(handle).unwrap();
    }

    #[test]
    fn opening_an_unmounted_path_is_invalid_argument() {
        let overlay = VirtualStorage::new().unwrap();
        let err = overlay.open("/nowhere").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn duplicate_mount_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume(dir.path(), "a");
        let overlay = VirtualStorage::new().unwrap();
        overlay.mount(Arc::clone(&vol), "/", "/mnt", Priority::DEFAULT).unwrap();
        assert!(overlay.mount(Arc::clone(&vol), "/", "/mnt", Priority::DEFAULT).is_err());
    }

    #[test]
    fn unmount_releases_the_claim_so_the_volume_can_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume(dir.path(), "a");
        let overlay = VirtualStorage::new().unwrap();
        overlay.mount(Arc::clone(&vol), "/", "/mnt", Priority::DEFAULT).unwrap();

        assert!(vol.shutdown().is_err());

        overlay.unmount(&vol, "/", "/mnt").unwrap();
        vol.shutdown().unwrap();
    }
}
