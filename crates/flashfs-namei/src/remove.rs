//! unlink and rmdir.

use tracing::{debug, warn};

use crate::error::{NamespaceError, Result};
use crate::inode::Inode;
use crate::namespace::{Namespace, OpGuard};
use crate::types::{DirEntry, Timestamp};

impl Namespace {
    /// Removes a non-directory entry.
    pub fn unlink(&self, dir: &Inode, name: &str) -> Result<()> {
        self.remove_name(dir, name, false)
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, dir: &Inode, name: &str) -> Result<()> {
        self.remove_name(dir, name, true)
    }

    fn remove_name(&self, dir: &Inode, name: &str, want_dir: bool) -> Result<()> {
        self.require_dir(dir)?;
        self.check_name_len(name)?;
        if name == "." || name == ".." {
            return Err(NamespaceError::InvalidArgument(format!(
                "cannot remove {:?}",
                name
            )));
        }
        self.check_folded_name(dir, name)?;

        let guard = self.lock();
        let Some(entry) = self.backend.entries.find(dir.ino(), name, dir.name_policy())? else {
            return Err(NamespaceError::EntryNotFound {
                parent: dir.ino(),
                name: name.to_string(),
            });
        };
        let inode = self.iget(entry.ino)?;
        let result = self.remove_checked_locked(&guard, dir, &entry, &inode, want_dir);
        drop(guard);

        self.iput(inode);
        if result.is_ok() {
            self.sync_dirs(&[dir]);
        }
        result
    }

    fn remove_checked_locked(
        &self,
        guard: &OpGuard<'_>,
        dir: &Inode,
        entry: &DirEntry,
        inode: &Inode,
        want_dir: bool,
    ) -> Result<()> {
        match (want_dir, inode.is_dir()) {
            (true, false) => return Err(NamespaceError::NotADirectory(inode.ino())),
            (false, true) => return Err(NamespaceError::IsADirectory(inode.ino())),
            (true, true) if !self.is_empty_dir(inode.ino())? => {
                return Err(NamespaceError::NotEmpty(inode.ino()));
            }
            _ => {}
        }
        self.backend.orphans.reserve()?;
        self.delete_entry_locked(guard, dir, entry, inode)
    }

    /// Removes `entry` from `dir` and drops the links it held: one for a
    /// file, two for a directory, whose parent also loses one. Consumes an
    /// orphan slot reserved by the caller, keeping it when the count
    /// reaches zero.
    pub(crate) fn delete_entry_locked(
        &self,
        _guard: &OpGuard<'_>,
        dir: &Inode,
        entry: &DirEntry,
        inode: &Inode,
    ) -> Result<()> {
        let policy = dir.name_policy();
        if let Err(e) = self.backend.entries.remove(dir.ino(), entry) {
            self.backend.orphans.release();
            return Err(e);
        }
        self.dcache.invalidate(dir.ino(), &entry.name, policy);

        let saved = [(inode, inode.attr()), (dir, dir.attr())];
        let is_dir = inode.is_dir();
        let now = Timestamp::now();
        let nlink = inode.update(|a| {
            a.ctime = now;
            if is_dir {
                a.nlink = a.nlink.saturating_sub(2);
                a.size = 0;
            } else {
                a.nlink = a.nlink.saturating_sub(1);
            }
            a.nlink
        });
        dir.update(|a| {
            if is_dir {
                a.nlink = a.nlink.saturating_sub(1);
            }
            a.mtime = now;
            a.ctime = now;
        });

        if let Err(e) = self.write_inodes(&[inode, dir]) {
            self.restore_attrs(&saved);
            if let Err(undo) = self.backend.entries.insert(dir.ino(), entry, policy) {
                warn!(parent = %dir.ino(), name = %entry.name, error = %undo, "failed to restore entry while unwinding");
            }
            self.backend.orphans.release();
            return Err(e);
        }

        if nlink == 0 {
            self.backend.orphans.add(inode.ino());
        } else {
            self.backend.orphans.release();
        }
        debug!(parent = %dir.ino(), ino = %inode.ino(), name = %entry.name, nlink, "entry deleted");
        Ok(())
    }
}
