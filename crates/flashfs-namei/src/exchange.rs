//! Atomic exchange of two existing names.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{NamespaceError, Result};
use crate::inode::Inode;
use crate::namespace::{Namespace, OpGuard};
use crate::rename::{UndoLog, UndoStep};
use crate::types::{DirEntry, FileType, InodeFlags, Timestamp};

struct ExchangePlan<'a> {
    old_dir: &'a Inode,
    old_entry: DirEntry,
    old_inode: &'a Inode,
    new_dir: &'a Inode,
    new_entry: DirEntry,
    new_inode: &'a Inode,
    old_dotdot: Option<DirEntry>,
    new_dotdot: Option<DirEntry>,
}

impl Namespace {
    /// Swaps the inodes behind two existing names. Both names keep
    /// existing throughout; when exactly one side is a directory the two
    /// parents trade a link.
    pub(crate) fn cross_rename(
        &self,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
    ) -> Result<()> {
        let mut handles = Vec::new();
        let guard = self.lock();
        let result =
            self.exchange_locked(&guard, old_dir, old_name, new_dir, new_name, &mut handles);
        drop(guard);

        for handle in handles {
            self.iput(handle);
        }
        if result.is_ok() {
            self.sync_dirs(&[old_dir, new_dir]);
            debug!(old_dir = %old_dir.ino(), old_name, new_dir = %new_dir.ino(), new_name, "exchanged");
        }
        result
    }

    fn exchange_locked(
        &self,
        guard: &OpGuard<'_>,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
        handles: &mut Vec<Arc<Inode>>,
    ) -> Result<()> {
        let old_entry = self.require_entry(old_dir, old_name)?;
        let new_entry = self.require_entry(new_dir, new_name)?;
        if old_entry.ino == new_entry.ino {
            return Ok(());
        }
        let old_inode = self.iget(old_entry.ino)?;
        handles.push(Arc::clone(&old_inode));
        let new_inode = self.iget(new_entry.ino)?;
        handles.push(Arc::clone(&new_inode));

        let cross_dir = old_dir.ino() != new_dir.ino();
        if cross_dir && (old_dir.has(InodeFlags::ENCRYPTED) || new_dir.has(InodeFlags::ENCRYPTED)) {
            let crypto = &self.backend.crypto;
            let into_new =
                crypto.policy_consistent(new_dir.read(|a| a.policy), old_inode.read(|a| a.policy));
            let into_old =
                crypto.policy_consistent(old_dir.read(|a| a.policy), new_inode.read(|a| a.policy));
            if !into_new || !into_old {
                return Err(NamespaceError::PermissionDenied);
            }
        }

        let (mut old_dotdot, mut new_dotdot) = (None, None);
        if cross_dir {
            for (moving, into) in [(&old_inode, new_dir), (&new_inode, old_dir)] {
                if moving.is_dir() && self.is_ancestor(moving.ino(), into.ino())? {
                    return Err(NamespaceError::InvalidArgument(format!(
                        "cannot move directory {} beneath itself",
                        moving.ino()
                    )));
                }
            }
            if old_inode.is_dir() != new_inode.is_dir() {
                let gaining = if old_inode.is_dir() { new_dir } else { old_dir };
                if gaining.nlink() >= self.config.link_max {
                    return Err(NamespaceError::TooManyLinks(gaining.ino()));
                }
            }
            if old_inode.is_dir() {
                old_dotdot = Some(self.moving_dotdot(guard, &old_inode, old_dir.ino())?);
            }
            if new_inode.is_dir() {
                new_dotdot = Some(self.moving_dotdot(guard, &new_inode, new_dir.ino())?);
            }
        }

        let plan = ExchangePlan {
            old_dir,
            old_entry,
            old_inode: &old_inode,
            new_dir,
            new_entry,
            new_inode: &new_inode,
            old_dotdot,
            new_dotdot,
        };
        let mut undo = UndoLog::new(self);
        for inode in [old_dir, new_dir, plan.old_inode, plan.new_inode] {
            undo.snapshot(inode);
        }
        match self.commit_exchange(&plan, &mut undo) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(old_dir = %old_dir.ino(), old_name, new_dir = %new_dir.ino(), new_name, error = %e, "exchange failed, rolling back");
                undo.rollback();
                Err(e)
            }
        }
    }

    fn commit_exchange<'a>(&self, plan: &ExchangePlan<'a>, undo: &mut UndoLog<'a>) -> Result<()> {
        let ExchangePlan {
            old_dir,
            old_inode,
            new_dir,
            new_inode,
            ..
        } = *plan;
        let entries = &self.backend.entries;
        let now = Timestamp::now();

        // Name metadata follows the entries.
        let old_enc = old_inode.has(InodeFlags::ENC_NAME) || old_dir.has(InodeFlags::ENCRYPTED);
        let new_enc = new_inode.has(InodeFlags::ENC_NAME) || new_dir.has(InodeFlags::ENCRYPTED);
        old_inode.update(|a| {
            a.name_hint = Some(plan.new_entry.name.clone());
            if new_enc {
                a.flags.insert(InodeFlags::ENC_NAME);
            }
        });
        self.write_inode(old_inode)?;
        new_inode.update(|a| {
            a.name_hint = Some(plan.old_entry.name.clone());
            if old_enc {
                a.flags.insert(InodeFlags::ENC_NAME);
            }
        });
        self.write_inode(new_inode)?;

        for (dir, dotdot, parent) in [
            (old_inode, &plan.old_dotdot, new_dir),
            (new_inode, &plan.new_dotdot, old_dir),
        ] {
            if let Some(dotdot) = dotdot {
                let repointed =
                    entries.retarget(dir.ino(), dotdot, parent.ino(), FileType::Directory)?;
                undo.push(UndoStep::Retarget {
                    dir: dir.ino(),
                    entry: repointed,
                    ino: dotdot.ino,
                    file_type: FileType::Directory,
                });
            }
        }

        for (dir, entry, from, to) in [
            (old_dir, &plan.old_entry, old_inode, new_inode),
            (new_dir, &plan.new_entry, new_inode, old_inode),
        ] {
            let swapped = entries.retarget(dir.ino(), entry, to.ino(), to.file_type())?;
            self.dcache.invalidate(dir.ino(), &entry.name, dir.name_policy());
            undo.push(UndoStep::Retarget {
                dir: dir.ino(),
                entry: swapped,
                ino: from.ino(),
                file_type: from.file_type(),
            });
        }

        for inode in [old_inode, new_inode] {
            inode.update(|a| {
                a.parent_hint = None;
                a.ctime = now;
            });
        }
        let trade_link = old_dir.ino() != new_dir.ino() && old_inode.is_dir() != new_inode.is_dir();
        let (losing, gaining) = if old_inode.is_dir() {
            (old_dir, new_dir)
        } else {
            (new_dir, old_dir)
        };
        if trade_link {
            losing.update(|a| a.nlink = a.nlink.saturating_sub(1));
            gaining.update(|a| a.nlink += 1);
        }
        for dir in [old_dir, new_dir] {
            dir.update(|a| {
                a.mtime = now;
                a.ctime = now;
            });
        }
        self.write_inodes(&[old_inode, new_inode, old_dir, new_dir])
    }
}
