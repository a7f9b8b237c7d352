//! Inode metadata pages.
//!
//! Pages are stored in the KV store with key format `inode/{inode_id_be}`;
//! the first data page of a symlink lives under `link/{inode_id_be}`.
//! Serialization uses bincode for compact binary encoding.

use std::sync::Arc;

use crate::error::{NamespaceError, Result};
use crate::kvstore::{BatchOp, KvStore};
use crate::types::{InodeAttr, InodeId};

const INODE_PREFIX: &[u8] = b"inode/";
const LINK_PREFIX: &[u8] = b"link/";

fn inode_key(ino: InodeId) -> Vec<u8> {
    let mut key = INODE_PREFIX.to_vec();
    key.extend_from_slice(&ino.as_u64().to_be_bytes());
    key
}

fn link_key(ino: InodeId) -> Vec<u8> {
    let mut key = LINK_PREFIX.to_vec();
    key.extend_from_slice(&ino.as_u64().to_be_bytes());
    key
}

/// Reads and writes inode pages on top of the KV store.
#[derive(Clone)]
pub struct InodeStore {
    kv: Arc<dyn KvStore>,
}

impl InodeStore {
    /// Creates a new InodeStore with the given KV store backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Writes an inode page, creating or replacing it.
    pub fn put_inode(&self, attr: &InodeAttr) -> Result<()> {
        let value = bincode::serialize(attr).map_err(|e| NamespaceError::Store(e.to_string()))?;
        self.kv.put(inode_key(attr.ino), value)
    }

    /// Loads an inode page.
    pub fn get_inode(&self, ino: InodeId) -> Result<InodeAttr> {
        match self.kv.get(&inode_key(ino))? {
            Some(value) => {
                bincode::deserialize(&value).map_err(|e| NamespaceError::Store(e.to_string()))
            }
            None => Err(NamespaceError::InodeNotFound(ino)),
        }
    }

    /// Removes the inode page together with its link page.
    pub fn delete_inode(&self, ino: InodeId) -> Result<()> {
        self.kv.write_batch(vec![
            BatchOp::Delete {
                key: inode_key(ino),
            },
            BatchOp::Delete { key: link_key(ino) },
        ])
    }

    /// Checks if an inode page exists.
    pub fn exists(&self, ino: InodeId) -> Result<bool> {
        self.kv.contains_key(&inode_key(ino))
    }

    /// Writes the first data page of a symlink.
    pub fn write_link(&self, ino: InodeId, page: Vec<u8>) -> Result<()> {
        self.kv.put(link_key(ino), page)
    }

    /// Reads the first data page of a symlink.
    pub fn read_link(&self, ino: InodeId) -> Result<Vec<u8>> {
        self.kv
            .get(&link_key(ino))?
            .ok_or(NamespaceError::InodeNotFound(ino))
    }

    /// Every persisted inode page, in identifier order.
    pub fn list_inodes(&self) -> Result<Vec<InodeAttr>> {
        self.kv
            .scan_prefix(INODE_PREFIX)?
            .into_iter()
            .map(|(_, value)| {
                bincode::deserialize(&value).map_err(|e| NamespaceError::Store(e.to_string()))
            })
            .collect()
    }

    /// Highest identifier with a persisted page.
    pub fn max_ino(&self) -> Result<Option<InodeId>> {
        let pages = self.kv.scan_prefix(INODE_PREFIX)?;
        let Some((key, _)) = pages.last() else {
            return Ok(None);
        };
        let raw: [u8; 8] = key[INODE_PREFIX.len()..]
            .try_into()
            .map_err(|_| NamespaceError::Corrupted("malformed inode key".to_string()))?;
        Ok(Some(InodeId::new(u64::from_be_bytes(raw))))
    }
}
