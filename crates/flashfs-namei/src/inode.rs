//! Live inodes and the inode cache.
//!
//! An [`Inode`] wraps the mutable inode record in its own lock so link
//! count, flag and name-hint updates on one inode never need the
//! filesystem-wide ordering lock. Handles are `Arc<Inode>` carrying one
//! counted reference each; the cache keeps an inode around until it is
//! evicted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{NamespaceError, Result};
use crate::types::{FileType, InodeAttr, InodeFlags, InodeId, NamePolicy};

/// Name metadata kept in the inode page, restorable as one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameMeta {
    /// Name the inode is linked under.
    pub name_hint: Option<String>,
    /// Parent the inode is linked under.
    pub parent_hint: Option<InodeId>,
    /// Name hint is encrypted.
    pub enc_name: bool,
}

/// An in-memory inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeId,
    file_type: FileType,
    attr: RwLock<InodeAttr>,
    refs: AtomicU32,
}

impl Inode {
    /// Wraps `attr` with one reference held by the caller.
    pub fn new(attr: InodeAttr) -> Self {
        Self {
            ino: attr.ino,
            file_type: attr.file_type,
            attr: RwLock::new(attr),
            refs: AtomicU32::new(1),
        }
    }

    /// Inode number.
    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// File type; fixed for the inode's lifetime.
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Copy of the current record.
    pub fn attr(&self) -> InodeAttr {
        self.attr.read().clone()
    }

    /// Reads the record under the inode lock.
    pub fn read<R>(&self, f: impl FnOnce(&InodeAttr) -> R) -> R {
        f(&self.attr.read())
    }

    /// Mutates the record under the inode lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut InodeAttr) -> R) -> R {
        f(&mut self.attr.write())
    }

    /// Current link count.
    pub fn nlink(&self) -> u32 {
        self.attr.read().nlink
    }

    /// Returns true if every bit of `flag` is set.
    pub fn has(&self, flag: InodeFlags) -> bool {
        self.attr.read().has(flag)
    }

    /// Sets or clears `flag`.
    pub fn set_flag(&self, flag: InodeFlags, on: bool) {
        self.attr.write().flags.set(flag, on);
    }

    /// Name comparison policy for entries of this directory.
    pub fn name_policy(&self) -> NamePolicy {
        self.attr.read().name_policy()
    }

    /// Snapshot of the name metadata.
    pub fn name_meta(&self) -> NameMeta {
        let attr = self.attr.read();
        NameMeta {
            name_hint: attr.name_hint.clone(),
            parent_hint: attr.parent_hint,
            enc_name: attr.has(InodeFlags::ENC_NAME),
        }
    }

    /// Puts back a snapshot taken by [`Inode::name_meta`].
    pub fn restore_name_meta(&self, meta: &NameMeta) {
        let mut attr = self.attr.write();
        attr.name_hint = meta.name_hint.clone();
        attr.parent_hint = meta.parent_hint;
        attr.flags.set(InodeFlags::ENC_NAME, meta.enc_name);
    }

    /// Takes a reference; returns the new count.
    pub fn grab(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a reference; returns the remaining count.
    pub fn put(&self) -> u32 {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Current reference count.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Live-inode cache keyed by inode number.
#[derive(Default)]
pub struct InodeCache {
    map: DashMap<InodeId, Arc<Inode>>,
}

impl InodeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly built inode; a live entry for the same number is a
    /// collision.
    pub fn insert_new(&self, inode: Arc<Inode>) -> Result<Arc<Inode>> {
        match self.map.entry(inode.ino()) {
            Entry::Occupied(_) => Err(NamespaceError::InodeCollision(inode.ino())),
            Entry::Vacant(slot) => {
                slot.insert(inode.clone());
                Ok(inode)
            }
        }
    }

    /// Returns the cached inode with a reference taken, or loads it.
    pub fn get_or_load(
        &self,
        ino: InodeId,
        load: impl FnOnce() -> Result<InodeAttr>,
    ) -> Result<Arc<Inode>> {
        match self.map.entry(ino) {
            Entry::Occupied(slot) => {
                let inode = slot.get().clone();
                inode.grab();
                Ok(inode)
            }
            Entry::Vacant(slot) => {
                let inode = Arc::new(Inode::new(load()?));
                slot.insert(inode.clone());
                Ok(inode)
            }
        }
    }

    /// Returns the cached inode without taking a reference.
    pub fn peek(&self, ino: InodeId) -> Option<Arc<Inode>> {
        self.map.get(&ino).map(|e| e.value().clone())
    }

    /// Drops the inode from the cache.
    pub fn remove(&self, ino: InodeId) -> Option<Arc<Inode>> {
        self.map.remove(&ino).map(|(_, inode)| inode)
    }

    /// Drops `inode` only if it is still the cached instance and nobody
    /// holds a reference. Atomic with respect to [`InodeCache::get_or_load`].
    pub fn remove_unused(&self, inode: &Arc<Inode>) -> bool {
        self.map
            .remove_if(&inode.ino(), |_, cached| {
                Arc::ptr_eq(cached, inode) && cached.refs() == 0
            })
            .is_some()
    }

    /// Number of cached inodes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_inode(id: u64) -> Arc<Inode> {
        Arc::new(Inode::new(InodeAttr::new(
            InodeId::new(id),
            FileType::RegularFile,
            0o644,
            0,
            0,
            0,
        )))
    }

    #[test]
    fn test_refcount() {
        let inode = make_inode(4);
        assert_eq!(inode.refs(), 1);
        assert_eq!(inode.grab(), 2);
        assert_eq!(inode.put(), 1);
        assert_eq!(inode.put(), 0);
        assert_eq!(inode.put(), 0);
    }

    #[test]
    fn test_update_and_flags() {
        let inode = make_inode(4);
        inode.update(|a| a.nlink += 1);
        assert_eq!(inode.nlink(), 2);
        inode.set_flag(InodeFlags::COLD, true);
        assert!(inode.has(InodeFlags::COLD));
        assert!(inode.read(|a| a.has(InodeFlags::COLD)));
    }

    #[test]
    fn test_name_meta_restore() {
        let inode = make_inode(4);
        let before = inode.name_meta();
        inode.update(|a| {
            a.name_hint = Some("x".to_string());
            a.parent_hint = Some(InodeId::new(3));
            a.flags.insert(InodeFlags::ENC_NAME);
        });
        assert_ne!(inode.name_meta(), before);
        inode.restore_name_meta(&before);
        assert_eq!(inode.name_meta(), before);
    }

    #[test]
    fn test_cache_collision() {
        let cache = InodeCache::new();
        cache.insert_new(make_inode(4)).unwrap();
        match cache.insert_new(make_inode(4)) {
            Err(NamespaceError::InodeCollision(id)) => assert_eq!(id, InodeId::new(4)),
            other => panic!("expected InodeCollision, got {:?}", other),
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_load_grabs_cached() {
        let cache = InodeCache::new();
        let inode = cache.insert_new(make_inode(4)).unwrap();
        let again = cache
            .get_or_load(InodeId::new(4), || panic!("must not load"))
            .unwrap();
        assert!(Arc::ptr_eq(&inode, &again));
        assert_eq!(inode.refs(), 2);

        let loaded = cache
            .get_or_load(InodeId::new(9), || {
                Ok(InodeAttr::new(InodeId::new(9), FileType::Fifo, 0o600, 0, 0, 0))
            })
            .unwrap();
        assert_eq!(loaded.refs(), 1);
        assert_eq!(loaded.file_type(), FileType::Fifo);
        assert!(cache.remove(InodeId::new(9)).is_some());
        assert!(cache.peek(InodeId::new(9)).is_none());
    }

    #[test]
    fn test_remove_unused_respects_refs() {
        let cache = InodeCache::new();
        let inode = cache.insert_new(make_inode(4)).unwrap();
        assert!(!cache.remove_unused(&inode));
        inode.put();
        assert!(cache.remove_unused(&inode));
        assert!(cache.is_empty());
    }
}
