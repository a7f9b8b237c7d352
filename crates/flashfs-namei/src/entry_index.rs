//! Directory entry index.
//!
//! Entries are stored in the KV store with key format
//! `dirent/{parent_inode_be}/{entry_name}`, so a prefix scan lists one
//! directory. Each call touches a single entry and is atomic on its own;
//! sequencing several calls into one namespace operation is the caller's job.

use std::sync::Arc;

use crate::error::{NamespaceError, Result};
use crate::kvstore::KvStore;
use crate::name_codec;
use crate::types::{DirEntry, FileType, InodeId, NamePolicy};

/// Key prefix for directory entries in the KV store.
const DIRENT_PREFIX: &[u8] = b"dirent/";

fn dirent_prefix(parent: InodeId) -> Vec<u8> {
    let mut key = DIRENT_PREFIX.to_vec();
    key.extend_from_slice(&parent.as_u64().to_be_bytes());
    key.push(b'/');
    key
}

fn dirent_key(parent: InodeId, name: &str) -> Vec<u8> {
    let mut key = dirent_prefix(parent);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Single-entry operations on directory storage.
pub trait EntryIndex: Send + Sync {
    /// Finds the entry in `dir` matching `name` under `policy`.
    fn find(&self, dir: InodeId, name: &str, policy: NamePolicy) -> Result<Option<DirEntry>>;

    /// Inserts `entry` into `dir`; fails with `AlreadyExists` when a name
    /// comparing equal under `policy` is present.
    fn insert(&self, dir: InodeId, entry: &DirEntry, policy: NamePolicy) -> Result<()>;

    /// Removes exactly `entry` from `dir`.
    fn remove(&self, dir: InodeId, entry: &DirEntry) -> Result<()>;

    /// Points an existing entry at a different inode, returning the updated
    /// entry.
    fn retarget(
        &self,
        dir: InodeId,
        entry: &DirEntry,
        ino: InodeId,
        file_type: FileType,
    ) -> Result<DirEntry>;

    /// Lists every entry of `dir`, dot entries included, sorted by name.
    fn list(&self, dir: InodeId) -> Result<Vec<DirEntry>>;
}

/// Entry index over the KV store.
#[derive(Clone)]
pub struct KvEntryIndex {
    kv: Arc<dyn KvStore>,
}

impl KvEntryIndex {
    /// Creates an index over the given store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn decode(value: &[u8]) -> Result<DirEntry> {
        bincode::deserialize(value).map_err(|e| NamespaceError::Store(e.to_string()))
    }

    fn encode(entry: &DirEntry) -> Result<Vec<u8>> {
        bincode::serialize(entry).map_err(|e| NamespaceError::Store(e.to_string()))
    }
}

impl EntryIndex for KvEntryIndex {
    fn find(&self, dir: InodeId, name: &str, policy: NamePolicy) -> Result<Option<DirEntry>> {
        if let Some(value) = self.kv.get(&dirent_key(dir, name))? {
            return Ok(Some(Self::decode(&value)?));
        }
        if policy == NamePolicy::Exact {
            return Ok(None);
        }
        // Case-insensitive lookup has to compare every name in the directory.
        // Dot entries only ever match exactly.
        for (_key, value) in self.kv.scan_prefix(&dirent_prefix(dir))? {
            let entry = Self::decode(&value)?;
            if entry.is_dot() {
                continue;
            }
            if name_codec::names_equal(&entry.name, name, policy) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn insert(&self, dir: InodeId, entry: &DirEntry, policy: NamePolicy) -> Result<()> {
        if self.find(dir, &entry.name, policy)?.is_some() {
            return Err(NamespaceError::AlreadyExists {
                parent: dir,
                name: entry.name.clone(),
            });
        }
        self.kv.put(dirent_key(dir, &entry.name), Self::encode(entry)?)
    }

    fn remove(&self, dir: InodeId, entry: &DirEntry) -> Result<()> {
        let key = dirent_key(dir, &entry.name);
        if !self.kv.contains_key(&key)? {
            return Err(NamespaceError::EntryNotFound {
                parent: dir,
                name: entry.name.clone(),
            });
        }
        self.kv.delete(&key)
    }

    fn retarget(
        &self,
        dir: InodeId,
        entry: &DirEntry,
        ino: InodeId,
        file_type: FileType,
    ) -> Result<DirEntry> {
        let key = dirent_key(dir, &entry.name);
        if !self.kv.contains_key(&key)? {
            return Err(NamespaceError::EntryNotFound {
                parent: dir,
                name: entry.name.clone(),
            });
        }
        let updated = DirEntry::new(entry.name.clone(), ino, file_type);
        self.kv.put(key, Self::encode(&updated)?)?;
        Ok(updated)
    }

    fn list(&self, dir: InodeId) -> Result<Vec<DirEntry>> {
        self.kv
            .scan_prefix(&dirent_prefix(dir))?
            .into_iter()
            .map(|(_key, value)| Self::decode(&value))
            .collect()
    }
}
