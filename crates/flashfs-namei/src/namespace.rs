//! The namespace: entry point for every structural mutation of the
//! directory tree.
//!
//! Two lock tiers are used. The ordering lock (`op_lock`) is held across
//! the commit of one logical operation, covering entry changes, link-count
//! changes and orphan registry changes together, so a checkpoint never
//! observes half an operation. Each [`Inode`] has its own lock for its
//! record. The ordering lock is always taken first.
//!
//! Helpers that must run under the ordering lock take an [`OpGuard`] as
//! proof. Dropping the last reference to an unlinked inode evicts it and
//! needs the ordering lock, so `iput` is never called while a guard is held.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::NamespaceConfig;
use crate::dcache::DentryCache;
use crate::error::{NamespaceError, Result};
use crate::inode::{Inode, InodeCache};
use crate::name_codec;
use crate::orphan;
use crate::types::{DirEntry, FileType, InodeAttr, InodeFlags, InodeId, NamePolicy};

/// Proof that the ordering lock is held.
pub struct OpGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// A mounted namespace.
pub struct Namespace {
    pub(crate) config: NamespaceConfig,
    pub(crate) backend: Backend,
    pub(crate) cache: InodeCache,
    pub(crate) dcache: DentryCache,
    op_lock: Mutex<()>,
    next_generation: AtomicU32,
}

impl Namespace {
    fn new(config: NamespaceConfig, backend: Backend) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            cache: InodeCache::new(),
            dcache: DentryCache::new(),
            op_lock: Mutex::new(()),
            next_generation: AtomicU32::new(rand::random()),
        })
    }

    /// Creates the root directory on an empty store and returns the mounted
    /// namespace.
    pub fn format(config: NamespaceConfig, backend: Backend) -> Result<Self> {
        let ns = Self::new(config, backend)?;
        let root_ino = ns.root_ino();
        if ns.backend.pages.exists(root_ino)? {
            return Err(NamespaceError::InvalidArgument(
                "store already holds a root directory".to_string(),
            ));
        }

        let mut root = InodeAttr::new_root(root_ino, 0o755);
        if ns.config.inline_dentry {
            root.flags.insert(InodeFlags::INLINE_DENTRY);
        }
        ns.backend.pages.put_inode(&root)?;
        ns.make_empty_dir(root_ino, root_ino)?;
        info!(root = %root_ino, block_size = ns.config.block_size, "namespace formatted");
        Ok(ns)
    }

    /// Mounts an existing store, reclaiming every inode left in the
    /// checkpointed orphan registry.
    pub fn mount(config: NamespaceConfig, backend: Backend) -> Result<Self> {
        let ns = Self::new(config, backend)?;
        let root_ino = ns.root_ino();
        if !ns.backend.pages.exists(root_ino)? {
            return Err(NamespaceError::Corrupted(format!(
                "root inode {} missing",
                root_ino
            )));
        }

        let orphans = ns.backend.orphans.snapshot();
        let count = orphans.len();
        for ino in orphans {
            ns.recover_orphan(ino)?;
        }
        let swept = ns.reclaim_unlinked()?;
        info!(root = %root_ino, recovered = count, swept, "namespace mounted");
        Ok(ns)
    }

    /// Reclaims pages whose link count reached zero after the last
    /// checkpoint. Nothing is open at mount, so an unreferenced page with no
    /// links can only be garbage.
    fn reclaim_unlinked(&self) -> Result<usize> {
        let guard = self.lock();
        let pages = self.backend.pages.list_inodes()?;
        let mut referenced = HashSet::new();
        for dir in pages
            .iter()
            .filter(|a| a.file_type == FileType::Directory && a.nlink > 0)
        {
            for entry in self.backend.entries.list(dir.ino)? {
                if !entry.is_dot() {
                    referenced.insert(entry.ino);
                }
            }
        }

        let mut swept = 0;
        for attr in pages {
            if attr.nlink > 0 || attr.ino == self.root_ino() {
                continue;
            }
            if referenced.contains(&attr.ino) {
                warn!(ino = %attr.ino, "unlinked inode still has an entry");
                continue;
            }
            debug!(ino = %attr.ino, "reclaiming unlinked inode missing from the orphan list");
            self.evict_locked(&guard, attr.ino, attr.file_type);
            swept += 1;
        }
        Ok(swept)
    }

    fn recover_orphan(&self, ino: InodeId) -> Result<()> {
        let guard = self.lock();
        match self.backend.pages.get_inode(ino) {
            Ok(attr) if attr.nlink > 0 => {
                warn!(ino = %ino, nlink = attr.nlink, "orphan was linked after the checkpoint");
                self.backend.orphans.remove(ino);
                Ok(())
            }
            Ok(attr) => {
                debug!(ino = %ino, nlink = attr.nlink, "reclaiming orphan");
                self.evict_locked(&guard, ino, attr.file_type);
                Ok(())
            }
            Err(NamespaceError::InodeNotFound(_)) => {
                self.backend.orphans.remove(ino);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Persists the orphan registry as a consistent snapshot.
    pub fn checkpoint(&self) -> Result<()> {
        let _guard = self.lock();
        orphan::store_checkpoint(self.backend.kv.as_ref(), self.backend.orphans.as_ref())?;
        info!(
            orphans = self.backend.orphans.snapshot().len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Mount configuration.
    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Collaborators the namespace runs on.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Number of inodes held in the live-inode cache.
    pub fn cached_inodes(&self) -> usize {
        self.cache.len()
    }

    /// Root directory identifier.
    pub fn root_ino(&self) -> InodeId {
        InodeId::new(self.config.root_ino)
    }

    /// Takes the ordering lock.
    pub(crate) fn lock(&self) -> OpGuard<'_> {
        OpGuard {
            _guard: self.op_lock.lock(),
        }
    }

    pub(crate) fn next_generation(&self) -> u32 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns a referenced handle to the root directory.
    pub fn root(&self) -> Result<Arc<Inode>> {
        self.iget(self.root_ino())
    }

    /// Returns a referenced handle to `ino`, loading its page if needed.
    pub fn iget(&self, ino: InodeId) -> Result<Arc<Inode>> {
        self.cache
            .get_or_load(ino, || self.backend.pages.get_inode(ino))
    }

    /// Drops a handle. The inode is evicted once it has neither references
    /// nor links.
    pub fn iput(&self, inode: Arc<Inode>) {
        if inode.put() > 0 || inode.nlink() > 0 {
            return;
        }
        let guard = self.lock();
        // A concurrent lookup may have taken a new reference or a link may
        // have been added since the checks above.
        if inode.nlink() > 0 || !self.cache.remove_unused(&inode) {
            return;
        }
        self.evict_locked(&guard, inode.ino(), inode.file_type());
    }

    /// Reclaims an inode with no links: its dot entries, pages, orphan
    /// record and identifier.
    pub(crate) fn evict_locked(&self, _guard: &OpGuard<'_>, ino: InodeId, file_type: FileType) {
        if file_type == FileType::Directory {
            match self.backend.entries.list(ino) {
                Ok(entries) => {
                    for entry in entries {
                        if let Err(e) = self.backend.entries.remove(ino, &entry) {
                            warn!(ino = %ino, name = %entry.name, error = %e, "failed to drop entry of evicted directory");
                        }
                    }
                }
                Err(e) => warn!(ino = %ino, error = %e, "failed to list evicted directory"),
            }
            self.dcache.invalidate_dir(ino);
        }
        if let Err(e) = self.backend.pages.delete_inode(ino) {
            warn!(ino = %ino, error = %e, "failed to delete inode page");
        }
        self.backend.orphans.remove(ino);
        self.backend.nids.release(ino);
        debug!(ino = %ino, "inode evicted");
    }

    /// Writes the inode page.
    pub(crate) fn write_inode(&self, inode: &Inode) -> Result<()> {
        self.backend.pages.put_inode(&inode.attr())
    }

    /// Writes several pages, stopping at the first failure.
    pub(crate) fn write_inodes(&self, inodes: &[&Inode]) -> Result<()> {
        for inode in inodes {
            self.write_inode(inode)?;
        }
        Ok(())
    }

    /// Puts back saved records and rewrites their pages, logging failures.
    pub(crate) fn restore_attrs(&self, saved: &[(&Inode, InodeAttr)]) {
        for (inode, attr) in saved {
            inode.update(|a| *a = attr.clone());
            if let Err(e) = self.write_inode(inode) {
                warn!(ino = %inode.ino(), error = %e, "failed to rewrite restored inode");
            }
        }
    }

    /// Rejects names that cannot be stored.
    pub(crate) fn check_name_len(&self, name: &str) -> Result<()> {
        if name.len() > self.config.max_name_len {
            return Err(NamespaceError::NameTooLong {
                len: name.len(),
                max: self.config.max_name_len,
            });
        }
        Ok(())
    }

    /// Rejects names a new entry in `dir` may not take.
    pub(crate) fn check_new_name(&self, dir: &Inode, name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(NamespaceError::InvalidArgument(format!(
                "invalid entry name {:?}",
                name
            )));
        }
        self.check_name_len(name)?;
        self.check_folded_name(dir, name)
    }

    /// Names made only of dots fold to nothing in a case-insensitive
    /// directory and would compare equal to its dot entries.
    pub(crate) fn check_folded_name(&self, dir: &Inode, name: &str) -> Result<()> {
        if dir.name_policy() == NamePolicy::CaseInsensitive
            && name_codec::striptail_len(name.as_bytes()) == 0
        {
            return Err(NamespaceError::InvalidArgument(format!(
                "name {:?} folds to nothing",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn require_dir(&self, dir: &Inode) -> Result<()> {
        if !dir.is_dir() {
            return Err(NamespaceError::NotADirectory(dir.ino()));
        }
        Ok(())
    }

    /// Resolves `name` in `dir`.
    ///
    /// Returns `Ok(None)` when no entry matches. A directory found still
    /// using the compact dot encoding gets explicit dot entries first.
    pub fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<Arc<Inode>>> {
        self.check_name_len(name)?;
        self.require_dir(dir)?;
        match name {
            "." => return self.iget(dir.ino()).map(Some),
            ".." => return self.get_parent(dir).map(Some),
            _ => {}
        }

        let Some(entry) = self.find_entry(dir, name)? else {
            return Ok(None);
        };
        let inode = self.iget(entry.ino)?;

        if let Some(policy) = dir.read(|a| a.policy) {
            let child_policy = inode.read(|a| a.policy);
            if inode.file_type().may_encrypt()
                && !self.backend.crypto.policy_consistent(Some(policy), child_policy)
            {
                warn!(parent = %dir.ino(), ino = %inode.ino(), "inconsistent encryption policy");
                self.iput(inode);
                return Err(NamespaceError::PermissionDenied);
            }
        }

        if inode.is_dir() && inode.has(InodeFlags::INLINE_DOTS) {
            if let Err(e) = self.recover_dot_entries(&inode, dir.ino()) {
                self.iput(inode);
                return Err(e);
            }
        }
        Ok(Some(inode))
    }

    /// Entry lookup through the dentry cache.
    fn find_entry(&self, dir: &Inode, name: &str) -> Result<Option<DirEntry>> {
        let policy = dir.name_policy();
        if let Some(entry) = self.dcache.get(dir.ino(), name, policy) {
            return Ok(Some(entry));
        }
        let token = self.dcache.begin_fill();
        let found = self.backend.entries.find(dir.ino(), name, policy)?;
        if let Some(entry) = &found {
            self.dcache.fill(token, dir.ino(), entry, policy);
        }
        Ok(found)
    }

    /// Inserts the `.` and `..` entries of a new directory.
    pub(crate) fn make_empty_dir(&self, ino: InodeId, parent: InodeId) -> Result<()> {
        let entries = &self.backend.entries;
        entries.insert(
            ino,
            &DirEntry::new(".", ino, FileType::Directory),
            NamePolicy::Exact,
        )?;
        let dotdot = DirEntry::new("..", parent, FileType::Directory);
        if let Err(e) = entries.insert(ino, &dotdot, NamePolicy::Exact) {
            if let Err(undo) = entries.remove(ino, &DirEntry::new(".", ino, FileType::Directory)) {
                warn!(ino = %ino, error = %undo, "failed to drop dot entry while unwinding");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Materialises `.` and `..` for a directory still using the compact
    /// dot encoding. Safe to race: existing entries are left alone and the
    /// flag is re-checked under the lock.
    pub fn recover_dot_entries(&self, dir: &Inode, parent: InodeId) -> Result<()> {
        let guard = self.lock();
        self.recover_dot_entries_locked(&guard, dir, parent)
    }

    pub(crate) fn recover_dot_entries_locked(
        &self,
        _guard: &OpGuard<'_>,
        dir: &Inode,
        parent: InodeId,
    ) -> Result<()> {
        if !dir.has(InodeFlags::INLINE_DOTS) {
            return Ok(());
        }
        let ino = dir.ino();
        for (name, target) in [(".", ino), ("..", parent)] {
            if self.backend.entries.find(ino, name, NamePolicy::Exact)?.is_some() {
                continue;
            }
            let entry = DirEntry::new(name, target, FileType::Directory);
            self.backend
                .entries
                .insert(ino, &entry, NamePolicy::Exact)
                .map_err(|e| {
                    warn!(ino = %ino, name, error = %e, "dot entry recovery failed");
                    NamespaceError::Corrupted(format!("cannot recover {:?} in {}: {}", name, ino, e))
                })?;
        }
        dir.set_flag(InodeFlags::INLINE_DOTS, false);
        self.write_inode(dir)?;
        info!(ino = %ino, parent = %parent, "recovered dot entries");
        Ok(())
    }

    /// Parent identifier of a directory, from its `..` entry or, for the
    /// compact dot encoding, from the recorded parent.
    pub(crate) fn parent_of(&self, dir: &Inode) -> Result<InodeId> {
        if dir.ino() == self.root_ino() {
            return Ok(dir.ino());
        }
        if let Some(entry) = self.backend.entries.find(dir.ino(), "..", NamePolicy::Exact)? {
            return Ok(entry.ino);
        }
        if dir.has(InodeFlags::INLINE_DOTS) {
            if let Some(parent) = dir.read(|a| a.parent_hint) {
                return Ok(parent);
            }
        }
        Err(NamespaceError::EntryNotFound {
            parent: dir.ino(),
            name: "..".to_string(),
        })
    }

    /// Returns a referenced handle to the parent of `dir`.
    pub fn get_parent(&self, dir: &Inode) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        let parent = self.parent_of(dir)?;
        self.iget(parent)
    }

    /// Returns true when `dir` holds nothing besides dot entries.
    pub fn is_empty_dir(&self, dir: InodeId) -> Result<bool> {
        Ok(self
            .backend
            .entries
            .list(dir)?
            .iter()
            .all(DirEntry::is_dot))
    }

    /// Returns true when `ancestor` is `dir` or lies on its path to the root.
    pub(crate) fn is_ancestor(&self, ancestor: InodeId, dir: InodeId) -> Result<bool> {
        let root = self.root_ino();
        let mut current = dir;
        for _ in 0..=self.config.max_inodes {
            if current == ancestor {
                return Ok(true);
            }
            if current == root {
                return Ok(false);
            }
            let inode = self.cache.peek(current);
            current = match inode {
                Some(inode) => self.parent_of(&inode)?,
                None => {
                    let attr = self.backend.pages.get_inode(current)?;
                    let inode = Inode::new(attr);
                    self.parent_of(&inode)?
                }
            };
        }
        Err(NamespaceError::Corrupted(format!(
            "parent chain of {} does not reach the root",
            dir
        )))
    }

    /// Opts an empty directory in or out of case-insensitive lookups.
    pub fn set_casefold(&self, dir: &Inode, enable: bool) -> Result<()> {
        self.require_dir(dir)?;
        let _guard = self.lock();
        if !self.is_empty_dir(dir.ino())? {
            return Err(NamespaceError::NotEmpty(dir.ino()));
        }
        let saved = dir.attr();
        dir.set_flag(InodeFlags::CASEFOLD, enable);
        if let Err(e) = self.write_inode(dir) {
            self.restore_attrs(&[(dir, saved)]);
            return Err(e);
        }
        self.dcache.invalidate_dir(dir.ino());
        debug!(ino = %dir.ino(), enable, "casefold updated");
        Ok(())
    }

    /// Issues a flush when the mount or either directory asks for
    /// synchronous directory updates. Call after dropping the guard.
    pub(crate) fn sync_dirs(&self, dirs: &[&Inode]) {
        let wanted = self.config.dirsync || dirs.iter().any(|d| d.has(InodeFlags::DIRSYNC));
        if !wanted {
            return;
        }
        if let Err(e) = self.backend.flusher.sync_fs() {
            warn!(error = %e, "directory sync failed");
        }
    }
}
