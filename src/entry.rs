//! The tree node: key, parent, name, properties, children, expirations.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::property::PropertyValue;

/// An entry key. `0` ([`INVALID_KEY`]) and `1` ([`ROOT_KEY`]) are reserved.
pub type Key = u64;

/// Never a valid entry key; denotes "no parent" / "no such entry".
pub const INVALID_KEY: Key = 0;

/// The key of the volume's root entry.
pub const ROOT_KEY: Key = 1;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

/// The bi-indexed child set of an entry: name and child key are each unique
/// within the owning entry (invariant 3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Children {
    by_name: BTreeMap<String, Key>,
    by_key: BTreeMap<Key, String>,
}

impl Children {
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Key> {
        self.by_name.get(name).copied()
    }

    pub fn contains_key(&self, key: Key) -> bool {
        self.by_key.contains_key(&key)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Key)> {
        self.by_name.iter().map(|(n, k)| (n.as_str(), *k))
    }

    fn insert(&mut self, name: String, key: Key) -> Result<()> {
        if self.by_name.contains_key(&name) {
            return Err(Error::invalid_argument("duplicate entry"));
        }
        self.by_name.insert(name.clone(), key);
        self.by_key.insert(key, name);
        Ok(())
    }

    fn remove_by_key(&mut self, key: Key) -> Result<()> {
        match self.by_key.remove(&key) {
            Some(name) => {
                self.by_name.remove(&name);
                Ok(())
            }
            None => Err(Error::invalid_argument("no such child entry")),
        }
    }
}

/// A tree node. See module docs and design spec §3 for the data model and
/// §4.C for the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    key: Key,
    parent: Key,
    name: String,
    properties: BTreeMap<String, PropertyValue>,
    children: Children,
    expirations: BTreeMap<String, i64>,
}

impl Entry {
    /// Creates a fresh, unlinked entry (`parent == INVALID_KEY`).
    pub fn new(key: Key, name: impl Into<String>) -> Self {
        Entry {
            key,
            parent: INVALID_KEY,
            name: name.into(),
            properties: BTreeMap::new(),
            children: Children::default(),
            expirations: BTreeMap::new(),
        }
    }

    /// Synthesizes the empty root entry (invariant 4).
    pub fn root() -> Self {
        Entry::new(ROOT_KEY, "")
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn parent(&self) -> Key {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &Children {
        &self.children
    }

    fn set_parent(&mut self, parent: Key) {
        self.parent = parent;
    }

    /// Restores the parent link read back from the wire format. Only the
    /// codec calls this: unlike [`Entry::add_child`], decoding never has a
    /// live child `Entry` on hand to update in lockstep, since children are
    /// referenced by key in the serialized form.
    pub(crate) fn restore_parent(&mut self, parent: Key) {
        self.parent = parent;
    }

    fn property_expired(&self, name: &str) -> bool {
        match self.expirations.get(name) {
            Some(&deadline) => now_millis() >= deadline,
            None => false,
        }
    }

    /// Removes every property whose expiration has already passed, along
    /// with its expiration entry. Used both as write-side hygiene (before
    /// serializing) and read-side hygiene (after deserializing), per §4.C.
    pub fn sweep_expired(&mut self) {
        let now = now_millis();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, &deadline)| now >= deadline)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            self.properties.remove(&name);
            self.expirations.remove(&name);
        }
    }

    pub fn has_property(&self, name: &str) -> bool {
        if self.property_expired(name) {
            return false;
        }
        self.properties.contains_key(name)
    }

    pub fn property(&self, name: &str) -> Result<PropertyValue> {
        if self.property_expired(name) {
            return Err(Error::not_found("no such property"));
        }
        self.properties.get(name).cloned().ok_or_else(|| Error::not_found("no such property"))
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: PropertyValue) {
        let name = name.into();
        self.expirations.remove(&name); // undo expiration
        self.properties.insert(name, value);
    }

    /// §9 Open Question: cancels expiration, then erases from the raw map.
    /// `Ok` if the raw map contained the key (even if logically expired),
    /// `NotFound` otherwise.
    pub fn remove_property(&mut self, name: &str) -> Result<()> {
        self.expirations.remove(name);
        if self.properties.remove(name).is_some() {
            Ok(())
        } else {
            Err(Error::not_found("no such property"))
        }
    }

    pub fn expire_property(&mut self, name: &str, deadline_millis: i64) -> Result<()> {
        if !self.has_property(name) {
            return Err(Error::not_found("no such property"));
        }
        self.expirations.insert(name.to_string(), deadline_millis);
        Ok(())
    }

    pub fn cancel_expiration(&mut self, name: &str) {
        self.expirations.remove(name);
    }

    pub fn properties(&self) -> BTreeMap<String, PropertyValue> {
        self.properties
            .iter()
            .filter(|(name, _)| !self.property_expired(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn properties_names(&self) -> Vec<String> {
        self.properties
            .keys()
            .filter(|name| !self.property_expired(name))
            .cloned()
            .collect()
    }

    /// Raw expirations map, used only by the codec for (de)serialization.
    pub(crate) fn raw_expirations(&self) -> &BTreeMap<String, i64> {
        &self.expirations
    }

    pub(crate) fn raw_properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    pub(crate) fn set_raw_property(&mut self, name: String, value: PropertyValue) {
        self.properties.insert(name, value);
    }

    pub(crate) fn set_raw_expiration(&mut self, name: String, deadline_millis: i64) {
        self.expirations.insert(name, deadline_millis);
    }

    /// Invariant 2: `child.parent == INVALID_KEY` beforehand; on success it
    /// becomes this entry's key.
    pub fn add_child(&mut self, child: &mut Entry) -> Result<()> {
        if child.parent() != INVALID_KEY {
            return Err(Error::invalid_argument("entry already has a parent"));
        }
        self.children.insert(child.name().to_string(), child.key())?;
        child.set_parent(self.key());
        Ok(())
    }

    /// Used only by the codec, which reconstructs children from the wire
    /// format without going through the normal two-entry `add_child` dance.
    pub(crate) fn link_child_raw(&mut self, name: String, key: Key) -> Result<()> {
        self.children.insert(name, key)
    }

    pub fn remove_child(&mut self, child: &mut Entry) -> Result<()> {
        self.children.remove_by_key(child.key())?;
        child.set_parent(INVALID_KEY);
        Ok(())
    }
}
