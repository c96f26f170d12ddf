//! A bounded, most-recently-used path -> key cache, used to skip repeated
//! tree walks during path resolution (§4.F). Grounded on the shape of the
//! original implementation's intrusive sequenced+hashed multi-index cache:
//! a hash lookup paired with an intrusive recency list, relocating an entry
//! to the front on every hit and evicting from the back on overflow.

use std::collections::HashMap;

use crate::entry::Key;

/// Default capacity, matching the original cache's default bound.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Node {
    path: String,
    key: Key,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    capacity: usize,
    nodes: Vec<Option<Node>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Inner {
    fn new(capacity: usize) -> Self {
        Inner {
            capacity: capacity.max(1),
            nodes: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("detach of vacant slot");
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[idx].as_mut().expect("push_front of vacant slot");
            node.prev = None;
            node.next = old_head;
        }
        if let Some(head) = old_head {
            self.nodes[head].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn evict_if_over_capacity(&mut self) {
        while self.index.len() > self.capacity {
            let Some(tail) = self.tail else { break };
            self.detach(tail);
            let node = self.nodes[tail].take().expect("tail slot was vacant");
            self.index.remove(&node.path);
            self.free.push(tail);
        }
    }
}

/// A spin-locked MRU cache from resolved path to entry key.
pub struct PathCache {
    inner: spin::Mutex<Inner>,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        PathCache { inner: spin::Mutex::new(Inner::new(capacity)) }
    }

    pub fn lookup(&self, path: &str) -> Option<Key> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(path)?;
        inner.touch(idx);
        Some(inner.nodes[idx].as_ref().unwrap().key)
    }

    pub fn insert(&self, path: impl Into<String>, key: Key) {
        let path = path.into();
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.index.get(&path) {
            inner.nodes[idx].as_mut().unwrap().key = key;
            inner.touch(idx);
            return;
        }

        let idx = match inner.free.pop() {
            Some(idx) => idx,
            None => {
                inner.nodes.push(None);
                inner.nodes.len() - 1
            }
        };
        inner.nodes[idx] = Some(Node { path: path.clone(), key, prev: None, next: None });
        inner.push_front(idx);
        inner.index.insert(path, idx);
        inner.evict_if_over_capacity();
    }

    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.index.remove(path) {
            inner.detach(idx);
            inner.nodes[idx] = None;
            inner.free.push(idx);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::new(inner.capacity);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }
}

impl Default for PathCache {
    fn default() -> Self {
        PathCache::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_roundtrip() {
        let cache = PathCache::new(4);
        cache.insert("/a/b", 7);
        assert_eq!(cache.lookup("/a/b"), Some(7));
        assert_eq!(cache.lookup("/missing"), None);
    }

    #[test]
    fn touching_on_lookup_protects_from_eviction() {
        let cache = PathCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // touch "a" so it's most-recently-used; "b" becomes the eviction candidate
        assert_eq!(cache.lookup("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.lookup("a"), Some(1));
        assert_eq!(cache.lookup("c"), Some(3));
        assert_eq!(cache.lookup("b"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn exceeding_capacity_evicts_least_recently_used() {
        let cache = PathCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("a"), None);
    }

    #[test]
    fn remove_forgets_entry_and_reuses_its_slot() {
        let cache = PathCache::new(4);
        cache.insert("a", 1);
        cache.remove("a");
        assert_eq!(cache.lookup("a"), None);
        assert!(cache.is_empty());

        cache.insert("b", 2);
        assert_eq!(cache.lookup("b"), Some(2));
    }

    #[test]
    fn reinserting_existing_path_updates_key_without_growing() {
        let cache = PathCache::new(4);
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.lookup("a"), Some(2));
        assert_eq!(cache.len(), 1);
    }
}
