//! Rename with replace, no-replace and whiteout semantics.
//!
//! A rename touches up to two directories, the moved inode, a replaced
//! target and a whiteout. All of it commits under one hold of the ordering
//! lock. Every completed step records how to reverse itself in an
//! [`UndoLog`] so a failure at any point puts the namespace back the way it
//! was before the call.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{NamespaceError, Result};
use crate::inode::Inode;
use crate::namespace::{Namespace, OpGuard};
use crate::types::{
    Credentials, DirEntry, FileType, InodeAttr, InodeFlags, InodeId, NamePolicy, RenameFlags,
    Timestamp,
};

/// One reversible step of a multi-entry operation.
pub(crate) enum UndoStep<'a> {
    /// Give back a reserved orphan slot.
    ReleaseOrphanSlot,
    /// Put back an inode record and rewrite its page.
    RestoreAttr(&'a Inode, InodeAttr),
    /// Re-insert a removed entry.
    InsertEntry {
        dir: InodeId,
        entry: DirEntry,
        policy: NamePolicy,
    },
    /// Drop an inserted entry.
    RemoveEntry { dir: InodeId, entry: DirEntry },
    /// Point a retargeted entry back at its previous inode.
    Retarget {
        dir: InodeId,
        entry: DirEntry,
        ino: InodeId,
        file_type: FileType,
    },
}

/// Reverse log of completed steps, replayed newest first on failure.
pub(crate) struct UndoLog<'a> {
    ns: &'a Namespace,
    steps: Vec<UndoStep<'a>>,
}

impl<'a> UndoLog<'a> {
    pub(crate) fn new(ns: &'a Namespace) -> Self {
        Self {
            ns,
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, step: UndoStep<'a>) {
        self.steps.push(step);
    }

    /// Records the current record of `inode`, once per inode.
    pub(crate) fn snapshot(&mut self, inode: &'a Inode) {
        let seen = self.steps.iter().any(|step| {
            matches!(step, UndoStep::RestoreAttr(saved, _) if saved.ino() == inode.ino())
        });
        if !seen {
            self.steps.push(UndoStep::RestoreAttr(inode, inode.attr()));
        }
    }

    /// Replays the log. Individual failures are logged and skipped.
    pub(crate) fn rollback(self) {
        let ns = self.ns;
        let entries = &ns.backend.entries;
        for step in self.steps.into_iter().rev() {
            let (dir, outcome) = match step {
                UndoStep::ReleaseOrphanSlot => {
                    ns.backend.orphans.release();
                    continue;
                }
                UndoStep::RestoreAttr(inode, attr) => {
                    ns.restore_attrs(&[(inode, attr)]);
                    continue;
                }
                UndoStep::InsertEntry { dir, entry, policy } => {
                    (dir, entries.insert(dir, &entry, policy))
                }
                UndoStep::RemoveEntry { dir, entry } => (dir, entries.remove(dir, &entry)),
                UndoStep::Retarget {
                    dir,
                    entry,
                    ino,
                    file_type,
                } => (dir, entries.retarget(dir, &entry, ino, file_type).map(|_| ())),
            };
            ns.dcache.invalidate_dir(dir);
            if let Err(e) = outcome {
                warn!(dir = %dir, error = %e, "rollback step failed");
            }
        }
    }
}

/// Everything a plain rename decided before touching state.
struct RenamePlan<'a> {
    old_dir: &'a Inode,
    old_entry: DirEntry,
    new_dir: &'a Inode,
    new_name: &'a str,
    source: &'a Inode,
    target: Option<(DirEntry, &'a Inode)>,
    dotdot: Option<DirEntry>,
    whiteout: Option<&'a Inode>,
}

impl Namespace {
    /// Moves `old_name` in `old_dir` to `new_name` in `new_dir`.
    ///
    /// An existing target is replaced unless `NOREPLACE` is given;
    /// `EXCHANGE` swaps the two names instead; `WHITEOUT` leaves a whiteout
    /// entry at the old name.
    pub fn rename(
        &self,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        let flags = RenameFlags::from_bits(flags.bits())?;
        self.require_dir(old_dir)?;
        self.require_dir(new_dir)?;
        self.check_new_name(old_dir, old_name)?;
        self.check_new_name(new_dir, new_name)?;
        if flags.contains(RenameFlags::EXCHANGE) {
            return self.cross_rename(old_dir, old_name, new_dir, new_name);
        }

        let whiteout = if flags.contains(RenameFlags::WHITEOUT) {
            let source = self.lookup(old_dir, old_name)?.ok_or_else(|| NamespaceError::EntryNotFound {
                parent: old_dir.ino(),
                name: old_name.to_string(),
            })?;
            let owner = source.read(|a| Credentials::new(a.uid, a.gid));
            self.iput(source);
            Some(self.create_whiteout(old_dir, owner)?)
        } else {
            None
        };

        let mut handles = Vec::new();
        let guard = self.lock();
        let result = self.rename_locked(
            &guard,
            old_dir,
            old_name,
            new_dir,
            new_name,
            flags,
            whiteout.as_deref(),
            &mut handles,
        );
        drop(guard);

        for handle in handles {
            self.iput(handle);
        }
        if let Some(whiteout) = whiteout {
            self.iput(whiteout);
        }
        if result.is_ok() {
            self.sync_dirs(&[old_dir, new_dir]);
            debug!(old_dir = %old_dir.ino(), old_name, new_dir = %new_dir.ino(), new_name, "renamed");
        }
        result
    }

    /// Resolves an entry that must exist.
    pub(crate) fn require_entry(&self, dir: &Inode, name: &str) -> Result<DirEntry> {
        self.backend
            .entries
            .find(dir.ino(), name, dir.name_policy())?
            .ok_or_else(|| NamespaceError::EntryNotFound {
                parent: dir.ino(),
                name: name.to_string(),
            })
    }

    /// Materialises the dot entries of a directory about to move and
    /// returns its `..` entry.
    pub(crate) fn moving_dotdot(
        &self,
        guard: &OpGuard<'_>,
        dir: &Inode,
        parent: InodeId,
    ) -> Result<DirEntry> {
        self.recover_dot_entries_locked(guard, dir, parent)?;
        self.backend
            .entries
            .find(dir.ino(), "..", NamePolicy::Exact)?
            .ok_or_else(|| {
                NamespaceError::Corrupted(format!("directory {} has no '..' entry", dir.ino()))
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_locked(
        &self,
        guard: &OpGuard<'_>,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
        flags: RenameFlags,
        whiteout: Option<&Inode>,
        handles: &mut Vec<Arc<Inode>>,
    ) -> Result<()> {
        let old_entry = self.require_entry(old_dir, old_name)?;
        let source = self.iget(old_entry.ino)?;
        handles.push(Arc::clone(&source));

        let cross_dir = old_dir.ino() != new_dir.ino();
        if cross_dir && new_dir.has(InodeFlags::ENCRYPTED) {
            let (dir_policy, policy) = (new_dir.read(|a| a.policy), source.read(|a| a.policy));
            if !self.backend.crypto.policy_consistent(dir_policy, policy) {
                return Err(NamespaceError::PermissionDenied);
            }
        }

        let target_entry = self
            .backend
            .entries
            .find(new_dir.ino(), new_name, new_dir.name_policy())?;
        let target = match target_entry {
            Some(entry) => {
                if flags.contains(RenameFlags::NOREPLACE) {
                    return Err(NamespaceError::AlreadyExists {
                        parent: new_dir.ino(),
                        name: new_name.to_string(),
                    });
                }
                if entry.ino == source.ino() {
                    return Ok(());
                }
                let inode = self.iget(entry.ino)?;
                handles.push(Arc::clone(&inode));
                Some((entry, inode))
            }
            None => None,
        };

        if let Some((_, target)) = &target {
            match (source.is_dir(), target.is_dir()) {
                (true, false) => return Err(NamespaceError::NotADirectory(target.ino())),
                (false, true) => return Err(NamespaceError::IsADirectory(target.ino())),
                (true, true) if !self.is_empty_dir(target.ino())? => {
                    return Err(NamespaceError::NotEmpty(target.ino()));
                }
                _ => {}
            }
        }

        let dotdot = if source.is_dir() {
            if cross_dir {
                if self.is_ancestor(source.ino(), new_dir.ino())? {
                    return Err(NamespaceError::InvalidArgument(format!(
                        "cannot move directory {} beneath itself",
                        source.ino()
                    )));
                }
                if target.is_none() && new_dir.nlink() >= self.config.link_max {
                    return Err(NamespaceError::TooManyLinks(new_dir.ino()));
                }
            }
            Some(self.moving_dotdot(guard, &source, old_dir.ino())?)
        } else {
            None
        };

        let plan = RenamePlan {
            old_dir,
            old_entry,
            new_dir,
            new_name,
            source: &source,
            target: target.as_ref().map(|(entry, inode)| (entry.clone(), inode.as_ref())),
            dotdot,
            whiteout,
        };

        let mut undo = UndoLog::new(self);
        for inode in [Some(old_dir), Some(new_dir), Some(plan.source)]
            .into_iter()
            .chain([plan.target.as_ref().map(|(_, t)| *t)])
            .flatten()
        {
            undo.snapshot(inode);
        }

        match self.commit_rename(guard, &plan, &mut undo) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(old_dir = %old_dir.ino(), old_name, new_dir = %new_dir.ino(), new_name, error = %e, "rename failed, rolling back");
                undo.rollback();
                Err(e)
            }
        }
    }

    fn commit_rename<'a>(
        &self,
        guard: &OpGuard<'_>,
        plan: &RenamePlan<'a>,
        undo: &mut UndoLog<'a>,
    ) -> Result<()> {
        let RenamePlan {
            old_dir,
            new_dir,
            source,
            ..
        } = *plan;
        let entries = &self.backend.entries;
        let now = Timestamp::now();
        let moving_dir = source.is_dir();

        match &plan.target {
            Some((target_entry, target)) => {
                self.backend.orphans.reserve()?;
                undo.push(UndoStep::ReleaseOrphanSlot);

                let enc_name = new_dir.has(InodeFlags::ENCRYPTED);
                source.update(|a| {
                    a.name_hint = Some(plan.new_name.to_string());
                    if enc_name {
                        a.flags.insert(InodeFlags::ENC_NAME);
                    }
                });
                self.write_inode(source)?;

                let moved = entries.retarget(
                    new_dir.ino(),
                    target_entry,
                    source.ino(),
                    source.file_type(),
                )?;
                self.dcache
                    .invalidate(new_dir.ino(), &target_entry.name, new_dir.name_policy());
                undo.push(UndoStep::Retarget {
                    dir: new_dir.ino(),
                    entry: moved,
                    ino: target.ino(),
                    file_type: target.file_type(),
                });

                let dropped = if target.is_dir() { 2 } else { 1 };
                target.update(|a| {
                    a.nlink = a.nlink.saturating_sub(dropped);
                    a.ctime = now;
                });
                self.write_inode(target)?;
            }
            None => {
                let entry = self.add_link_locked(guard, new_dir, plan.new_name, source)?;
                undo.push(UndoStep::RemoveEntry {
                    dir: new_dir.ino(),
                    entry,
                });
                if moving_dir {
                    new_dir.update(|a| a.nlink += 1);
                    self.write_inode(new_dir)?;
                }
            }
        }

        let target_enc_name = plan
            .target
            .as_ref()
            .is_some_and(|(_, t)| t.has(InodeFlags::ENC_NAME));
        source.update(|a| {
            a.parent_hint = None;
            if target_enc_name {
                a.flags.insert(InodeFlags::ENC_NAME);
            }
            a.ctime = now;
        });
        self.write_inode(source)?;

        entries.remove(old_dir.ino(), &plan.old_entry)?;
        self.dcache
            .invalidate(old_dir.ino(), &plan.old_entry.name, old_dir.name_policy());
        undo.push(UndoStep::InsertEntry {
            dir: old_dir.ino(),
            entry: plan.old_entry.clone(),
            policy: old_dir.name_policy(),
        });
        old_dir.update(|a| {
            a.mtime = now;
            a.ctime = now;
        });

        if let Some(dotdot) = &plan.dotdot {
            if old_dir.ino() != new_dir.ino() {
                let repointed =
                    entries.retarget(source.ino(), dotdot, new_dir.ino(), FileType::Directory)?;
                undo.push(UndoStep::Retarget {
                    dir: source.ino(),
                    entry: repointed,
                    ino: dotdot.ino,
                    file_type: FileType::Directory,
                });
            }
            old_dir.update(|a| a.nlink = a.nlink.saturating_sub(1));
        }
        self.write_inodes(&[old_dir, new_dir])?;

        if let Some(whiteout) = plan.whiteout {
            whiteout.set_flag(InodeFlags::INC_LINK, true);
            if let Err(e) = self.add_link_locked(guard, old_dir, &plan.old_entry.name, whiteout) {
                whiteout.set_flag(InodeFlags::INC_LINK, false);
                return Err(e);
            }
        }

        if let Some((_, target)) = &plan.target {
            if target.nlink() == 0 {
                self.backend.orphans.add(target.ino());
            } else {
                self.backend.orphans.release();
            }
        }
        Ok(())
    }
}
