//! `entry-vault`: a persistent, hierarchical key-value store.
//!
//! The data model is a tree of entries, each bearing typed properties and
//! named child links, persisted through a log-structured block device and
//! fronted by an in-memory control-block cache (see [`storage`] and
//! [`volume`]). Independent volumes can be mounted under shared virtual
//! paths and fanned out to as one namespace (see [`virtual_storage`]).

#[macro_use]
extern crate tracing;

pub mod codec;
pub mod config;
pub mod control_block;
pub mod entry;
pub mod error;
pub mod path_cache;
pub mod property;
pub mod storage;
pub mod virtual_storage;
pub mod volume;

pub use config::OpenOptions;
pub use entry::{Entry, Key, INVALID_KEY, ROOT_KEY};
pub use error::{Error, ErrorKind, Result};
pub use property::PropertyValue;
pub use storage::StorageEngine;
pub use virtual_storage::{Priority, VirtualStorage};
pub use volume::{ClaimToken, Volume};
