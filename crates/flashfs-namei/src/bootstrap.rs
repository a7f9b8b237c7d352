//! Construction of brand-new inodes and disposal of ones that never made
//! it into the namespace.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::inode::Inode;
use crate::namespace::{Namespace, OpGuard};
use crate::types::{Credentials, FileType, InodeAttr, InodeFlags, OpsKind};

const S_ISGID: u32 = 0o2000;

/// Whether `name` has the form `stem.ext` with `ext` matching `extension`.
fn has_extension(name: &str, extension: &str) -> bool {
    let (name, ext) = (name.as_bytes(), extension.as_bytes());
    if ext.is_empty() || name.len() < ext.len() + 2 {
        return false;
    }
    let split = name.len() - ext.len();
    name[split - 1] == b'.' && name[split..].eq_ignore_ascii_case(ext)
}

impl Namespace {
    /// Builds a new inode under `dir` and registers it in the inode cache.
    ///
    /// The identifier stays in flight until the caller finalizes it. The
    /// inode carries `NEW_INODE` until its first link writes the page.
    pub(crate) fn new_inode(
        &self,
        dir: &Inode,
        file_type: FileType,
        mode: u32,
        creds: Credentials,
    ) -> Result<Arc<Inode>> {
        let ino = {
            let _guard = self.lock();
            self.backend.nids.allocate_id()?
        };

        let parent = dir.attr();
        let mut mode = mode & 0o7777;
        let gid = if parent.mode & S_ISGID != 0 {
            if file_type == FileType::Directory {
                mode |= S_ISGID;
            }
            parent.gid
        } else {
            creds.gid
        };

        let mut attr = InodeAttr::new(ino, file_type, mode, creds.uid, gid, self.next_generation());
        if parent.has(InodeFlags::ENCRYPTED) && file_type.may_encrypt() {
            attr.flags.insert(InodeFlags::ENCRYPTED);
            attr.policy = parent.policy;
        }
        attr.ops = OpsKind::for_new(file_type, attr.has(InodeFlags::ENCRYPTED));

        match file_type {
            FileType::RegularFile | FileType::Symlink if self.config.inline_data => {
                // Encrypted regular file data never lives inline.
                if !(file_type == FileType::RegularFile && attr.has(InodeFlags::ENCRYPTED)) {
                    attr.flags.insert(InodeFlags::INLINE_DATA);
                }
            }
            FileType::Directory => {
                if parent.has(InodeFlags::CASEFOLD) {
                    attr.flags.insert(InodeFlags::CASEFOLD);
                }
                if self.config.inline_dentry {
                    attr.flags.insert(InodeFlags::INLINE_DENTRY);
                    if self.config.legacy_inline_dots {
                        attr.flags.insert(InodeFlags::INLINE_DOTS);
                    }
                }
            }
            _ => {}
        }
        attr.flags.insert(InodeFlags::NEW_INODE);

        match self.cache.insert_new(Arc::new(Inode::new(attr))) {
            Ok(inode) => {
                debug!(ino = %ino, parent = %dir.ino(), ?file_type, "new inode");
                Ok(inode)
            }
            Err(e) => {
                warn!(ino = %ino, error = %e, "inode cache collision");
                self.backend.nids.release(ino);
                Err(e)
            }
        }
    }

    /// Discards an inode whose creation failed: marks it bad, drops it from
    /// the cache, deletes any page already written and frees its identifier.
    pub(crate) fn fail_inode_locked(&self, _guard: &OpGuard<'_>, inode: &Inode) {
        let ino = inode.ino();
        inode.update(|a| {
            a.nlink = 0;
            a.flags.insert(InodeFlags::BAD | InodeFlags::PENDING_FREE);
        });
        self.cache.remove(ino);
        if let Err(e) = self.backend.pages.delete_inode(ino) {
            warn!(ino = %ino, error = %e, "failed to delete page of failed inode");
        }
        self.backend.nids.release(ino);
        warn!(ino = %ino, "discarded failed inode");
    }

    /// Flags media files as cold by their extension.
    pub(crate) fn set_cold_file(&self, inode: &Inode, name: &str) {
        if self
            .config
            .cold_extensions
            .iter()
            .any(|ext| has_extension(name, ext))
        {
            inode.set_flag(InodeFlags::COLD, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::NamespaceConfig;
    use crate::crypt::{KeyMaterial, KeyringCrypto};
    use crate::error::NamespaceError;
    use crate::types::{InodeId, PolicyId};

    fn make_ns(config: NamespaceConfig) -> Namespace {
        let crypto = Arc::new(KeyringCrypto::new(KeyMaterial([1u8; 32])));
        let backend = Backend::in_memory(&config, crypto);
        Namespace::format(config, backend).unwrap()
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension("movie.mp4", "mp4"));
        assert!(has_extension("MOVIE.MP4", "mp4"));
        assert!(!has_extension(".mp4", "mp4"));
        assert!(!has_extension("mp4", "mp4"));
        assert!(!has_extension("moviemp4", "mp4"));
        assert!(!has_extension("a.mp4", ""));
    }

    #[test]
    fn test_setgid_directory_inheritance() {
        let ns = make_ns(NamespaceConfig::default());
        let root = ns.root().unwrap();
        root.update(|a| {
            a.mode |= S_ISGID;
            a.gid = 500;
        });

        let file = ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::new(1000, 1000)).unwrap();
        assert_eq!(file.attr().gid, 500);
        assert_eq!(file.attr().mode & S_ISGID, 0);
        assert_eq!(file.attr().uid, 1000);

        let dir = ns.new_inode(&root, FileType::Directory, 0o755, Credentials::new(1000, 1000)).unwrap();
        assert_eq!(dir.attr().gid, 500);
        assert_ne!(dir.attr().mode & S_ISGID, 0);
    }

    #[test]
    fn test_inherits_encryption_and_flags() {
        let ns = make_ns(NamespaceConfig::default());
        let root = ns.root().unwrap();
        root.update(|a| {
            a.flags.insert(InodeFlags::ENCRYPTED);
            a.policy = Some(PolicyId::new(5));
        });

        let file = ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()).unwrap();
        let attr = file.attr();
        assert!(attr.has(InodeFlags::ENCRYPTED));
        assert_eq!(attr.policy, Some(PolicyId::new(5)));
        assert!(!attr.has(InodeFlags::INLINE_DATA));
        assert!(attr.has(InodeFlags::NEW_INODE));

        let link = ns.new_inode(&root, FileType::Symlink, 0o777, Credentials::root()).unwrap();
        assert_eq!(link.attr().ops, OpsKind::EncryptedSymlink);
        assert!(link.has(InodeFlags::INLINE_DATA));

        let fifo = ns.new_inode(&root, FileType::Fifo, 0o600, Credentials::root()).unwrap();
        assert!(!fifo.has(InodeFlags::ENCRYPTED));
        assert_eq!(fifo.attr().ops, OpsKind::Special);
    }

    #[test]
    fn test_collision_releases_id() {
        let config = NamespaceConfig {
            max_inodes: 1,
            ..Default::default()
        };
        let ns = make_ns(config);
        let root = ns.root().unwrap();
        let squatter = Arc::new(Inode::new(InodeAttr::new(
            InodeId::new(4),
            FileType::RegularFile,
            0o644,
            0,
            0,
            0,
        )));
        ns.cache.insert_new(squatter).unwrap();

        match ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()) {
            Err(NamespaceError::InodeCollision(id)) => assert_eq!(id, InodeId::new(4)),
            other => panic!("expected InodeCollision, got {:?}", other),
        }
        ns.cache.remove(InodeId::new(4));
        let inode = ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()).unwrap();
        assert_eq!(inode.ino(), InodeId::new(4));
    }

    #[test]
    fn test_exhaustion() {
        let config = NamespaceConfig {
            max_inodes: 1,
            ..Default::default()
        };
        let ns = make_ns(config);
        let root = ns.root().unwrap();
        ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()).unwrap();
        assert!(matches!(
            ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()),
            Err(NamespaceError::NoSpace)
        ));
    }

    #[test]
    fn test_fail_inode_discards() {
        let ns = make_ns(NamespaceConfig::default());
        let root = ns.root().unwrap();
        let inode = ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()).unwrap();
        let ino = inode.ino();
        {
            let guard = ns.lock();
            ns.fail_inode_locked(&guard, &inode);
        }
        assert!(inode.has(InodeFlags::BAD));
        assert_eq!(inode.nlink(), 0);
        assert!(ns.cache.peek(ino).is_none());
        let again = ns.new_inode(&root, FileType::RegularFile, 0o644, Credentials::root()).unwrap();
        assert_eq!(again.ino(), ino);
    }
}
