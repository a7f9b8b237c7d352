//! Operations that add one name: create, link, mkdir, mknod, tmpfile and
//! whiteout creation.
//!
//! Each one bootstraps (or reuses) an inode, then inserts a single entry
//! under the ordering lock. A failed insertion leaves nothing behind: the
//! bootstrapped inode is discarded and any flag set for the link is
//! cleared again.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{NamespaceError, Result};
use crate::inode::Inode;
use crate::namespace::{Namespace, OpGuard};
use crate::types::{
    Credentials, DevId, DirEntry, FileType, InodeFlags, InodeId, NamePolicy, OpsKind, Timestamp,
};

impl Namespace {
    /// Inserts `name` in `dir` pointing at `inode` and applies the link
    /// bookkeeping:
    /// - a new directory gets its dot entries and bumps the parent's count
    /// - a pending link increment raises the count, relinking an orphan
    ///   takes it off the registry and consumes the linkable exception
    /// - the name hint and parent are recorded, flagged encrypted inside an
    ///   encrypted directory
    ///
    /// Either everything is applied and persisted or nothing is.
    pub(crate) fn add_link_locked(
        &self,
        _guard: &OpGuard<'_>,
        dir: &Inode,
        name: &str,
        inode: &Inode,
    ) -> Result<DirEntry> {
        let entries = &self.backend.entries;
        let ino = inode.ino();
        let is_new = inode.has(InodeFlags::NEW_INODE);
        let entry = DirEntry::new(name, ino, inode.file_type());
        if is_new && inode.is_dir() && dir.nlink() >= self.config.link_max {
            return Err(NamespaceError::TooManyLinks(dir.ino()));
        }

        let mut made_dots = false;
        if is_new && inode.is_dir() && !inode.has(InodeFlags::INLINE_DOTS) {
            self.make_empty_dir(ino, dir.ino())?;
            made_dots = true;
        }
        if let Err(e) = entries.insert(dir.ino(), &entry, dir.name_policy()) {
            if made_dots {
                self.drop_dot_entries(ino);
            }
            return Err(e);
        }

        let saved = [(inode, inode.attr()), (dir, dir.attr())];
        let dir_encrypted = dir.has(InodeFlags::ENCRYPTED);
        let now = Timestamp::now();
        let relinked = inode.update(|a| {
            a.name_hint = Some(name.to_string());
            a.parent_hint = Some(dir.ino());
            if dir_encrypted {
                a.flags.insert(InodeFlags::ENC_NAME);
            }
            let mut relinked = false;
            if a.has(InodeFlags::INC_LINK) {
                relinked = a.nlink == 0;
                a.nlink += 1;
                a.flags.remove(InodeFlags::INC_LINK | InodeFlags::LINKABLE);
            }
            a.flags.remove(InodeFlags::NEW_INODE);
            a.ctime = now;
            relinked
        });
        let parent_gains_subdir = is_new && inode.is_dir();
        dir.update(|a| {
            if parent_gains_subdir {
                a.nlink += 1;
            }
            a.mtime = now;
            a.ctime = now;
        });

        if let Err(e) = self.write_inodes(&[inode, dir]) {
            self.restore_attrs(&saved);
            if let Err(undo) = entries.remove(dir.ino(), &entry) {
                warn!(parent = %dir.ino(), name, error = %undo, "failed to drop entry while unwinding");
            }
            if made_dots {
                self.drop_dot_entries(ino);
            }
            return Err(e);
        }
        if relinked {
            self.backend.orphans.remove(ino);
        }
        debug!(parent = %dir.ino(), ino = %ino, name, "entry added");
        Ok(entry)
    }

    fn drop_dot_entries(&self, ino: InodeId) {
        for name in [".", ".."] {
            let dropped = self
                .backend
                .entries
                .find(ino, name, NamePolicy::Exact)
                .and_then(|found| match found {
                    Some(entry) => self.backend.entries.remove(ino, &entry),
                    None => Ok(()),
                });
            if let Err(e) = dropped {
                warn!(ino = %ino, name, error = %e, "failed to drop dot entry while unwinding");
            }
        }
    }

    /// Links a freshly bootstrapped inode, discarding it on failure, then
    /// finalizes its identifier.
    fn instantiate(&self, dir: &Inode, name: &str, inode: &Arc<Inode>) -> Result<()> {
        let guard = self.lock();
        if let Err(e) = self.add_link_locked(&guard, dir, name, inode) {
            inode.set_flag(InodeFlags::INC_LINK, false);
            self.fail_inode_locked(&guard, inode);
            return Err(e);
        }
        drop(guard);
        self.backend.nids.finalize(inode.ino());
        self.sync_dirs(&[dir]);
        Ok(())
    }

    /// Creates a regular file.
    pub fn create(
        &self,
        dir: &Inode,
        name: &str,
        mode: u32,
        creds: Credentials,
    ) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        self.check_new_name(dir, name)?;
        let inode = self.new_inode(dir, FileType::RegularFile, mode, creds)?;
        if !self.config.disable_ext_identify {
            self.set_cold_file(&inode, name);
        }
        self.instantiate(dir, name, &inode)?;
        debug!(parent = %dir.ino(), ino = %inode.ino(), name, "created file");
        Ok(inode)
    }

    /// Creates a directory. Its link count reaches two once linked and the
    /// parent gains one.
    pub fn mkdir(
        &self,
        dir: &Inode,
        name: &str,
        mode: u32,
        creds: Credentials,
    ) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        self.check_new_name(dir, name)?;
        // Rechecked under the ordering lock when the entry is added.
        if dir.nlink() >= self.config.link_max {
            return Err(NamespaceError::TooManyLinks(dir.ino()));
        }
        let inode = self.new_inode(dir, FileType::Directory, mode, creds)?;
        inode.set_flag(InodeFlags::INC_LINK, true);
        self.instantiate(dir, name, &inode)?;
        debug!(parent = %dir.ino(), ino = %inode.ino(), name, "created directory");
        Ok(inode)
    }

    /// Creates a device, fifo or socket node.
    pub fn mknod(
        &self,
        dir: &Inode,
        name: &str,
        file_type: FileType,
        mode: u32,
        rdev: DevId,
        creds: Credentials,
    ) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        self.check_new_name(dir, name)?;
        if !file_type.is_special() {
            return Err(NamespaceError::InvalidArgument(format!(
                "mknod cannot create {:?}",
                file_type
            )));
        }
        if !rdev.is_valid() {
            return Err(NamespaceError::InvalidArgument(format!(
                "invalid device number {}:{}",
                rdev.major, rdev.minor
            )));
        }
        let inode = self.new_inode(dir, file_type, mode, creds)?;
        inode.update(|a| a.rdev = rdev);
        self.instantiate(dir, name, &inode)?;
        Ok(inode)
    }

    /// Adds a hard link to an existing non-directory inode.
    pub fn link(&self, inode: &Arc<Inode>, dir: &Inode, name: &str) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        self.check_new_name(dir, name)?;
        if inode.is_dir() {
            return Err(NamespaceError::PermissionDenied);
        }
        let (dir_policy, policy) = (dir.read(|a| a.policy), inode.read(|a| a.policy));
        if dir.has(InodeFlags::ENCRYPTED)
            && !self.backend.crypto.policy_consistent(dir_policy, policy)
        {
            return Err(NamespaceError::PermissionDenied);
        }

        inode.grab();
        let guard = self.lock();
        let nlink = inode.nlink();
        let checked = if nlink == 0 && !inode.has(InodeFlags::LINKABLE) {
            Err(NamespaceError::InodeNotFound(inode.ino()))
        } else if nlink >= self.config.link_max {
            Err(NamespaceError::TooManyLinks(inode.ino()))
        } else {
            Ok(())
        };
        let result = checked.and_then(|_| {
            inode.set_flag(InodeFlags::INC_LINK, true);
            self.add_link_locked(&guard, dir, name, inode)
        });
        drop(guard);

        match result {
            Ok(_) => {
                self.sync_dirs(&[dir]);
                debug!(parent = %dir.ino(), ino = %inode.ino(), name, "linked");
                Ok(inode.clone())
            }
            Err(e) => {
                inode.set_flag(InodeFlags::INC_LINK, false);
                self.iput(inode.clone());
                Err(e)
            }
        }
    }

    /// Creates an unnamed regular file, recorded as an orphan so it is
    /// reclaimed if it is never linked. It may later be linked despite
    /// having no links.
    pub fn tmpfile(&self, dir: &Inode, mode: u32, creds: Credentials) -> Result<Arc<Inode>> {
        self.unnamed_inode(dir, FileType::RegularFile, mode, DevId::default(), creds)
    }

    /// Creates the character-special placeholder used by rename's
    /// whiteout mode. Like a tmpfile it starts orphaned and linkable.
    pub fn create_whiteout(&self, dir: &Inode, creds: Credentials) -> Result<Arc<Inode>> {
        self.unnamed_inode(dir, FileType::CharDevice, 0, DevId::WHITEOUT, creds)
    }

    fn unnamed_inode(
        &self,
        dir: &Inode,
        file_type: FileType,
        mode: u32,
        rdev: DevId,
        creds: Credentials,
    ) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        if let Some(policy) = dir.read(|a| a.policy) {
            if !self.backend.crypto.has_key(policy) {
                return Err(NamespaceError::KeyUnavailable);
            }
        }
        let inode = self.new_inode(dir, file_type, mode, creds)?;
        let whiteout = rdev == DevId::WHITEOUT && file_type == FileType::CharDevice;

        let guard = self.lock();
        if let Err(e) = self.backend.orphans.reserve() {
            self.fail_inode_locked(&guard, &inode);
            return Err(e);
        }
        inode.update(|a| {
            a.rdev = rdev;
            if whiteout {
                a.ops = OpsKind::Special;
            }
            a.nlink = 0;
            a.flags.remove(InodeFlags::NEW_INODE);
            a.flags.insert(InodeFlags::LINKABLE);
        });
        if let Err(e) = self.write_inode(&inode) {
            self.backend.orphans.release();
            self.fail_inode_locked(&guard, &inode);
            return Err(e);
        }
        self.backend.orphans.add(inode.ino());
        drop(guard);

        self.backend.nids.finalize(inode.ino());
        debug!(parent = %dir.ino(), ino = %inode.ino(), whiteout, "unnamed inode created");
        Ok(inode)
    }
}
