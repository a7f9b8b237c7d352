//! Ordered key-value store standing in for the persistent media.
//!
//! Inode pages, directory entries and the checkpointed orphan list all live
//! here. Dropping every in-memory structure and re-opening a namespace over
//! the same store is how a power cut is simulated.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait backing the namespace collaborators.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}

/// A single operation in a write batch.
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// In-memory KV store backed by a BTreeMap.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.data.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryKvStore::new();
        store.put(b"inode/1".to_vec(), b"page".to_vec()).unwrap();
        assert_eq!(store.get(b"inode/1").unwrap(), Some(b"page".to_vec()));
        assert_eq!(store.get(b"inode/2").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let store = MemoryKvStore::new();
        store.put(b"dirent/a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"dirent/b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"inode/x".to_vec(), b"3".to_vec()).unwrap();

        let result = store.scan_prefix(b"dirent/").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"dirent/a");
        assert_eq!(result[1].0, b"dirent/b");
    }

    #[test]
    fn test_write_batch() {
        let store = MemoryKvStore::new();
        store.put(b"existing".to_vec(), b"old".to_vec()).unwrap();

        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"new".to_vec(),
                    value: b"v".to_vec(),
                },
                BatchOp::Delete {
                    key: b"existing".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(store.get(b"new").unwrap(), Some(b"v".to_vec()));
        assert!(!store.contains_key(b"existing").unwrap());
    }

    #[test]
    fn test_clones_share_media() {
        let store = MemoryKvStore::new();
        let other = store.clone();
        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(other.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(other.len(), 1);
    }
}
