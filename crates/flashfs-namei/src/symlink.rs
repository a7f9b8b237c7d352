//! Symbolic links: creation and target resolution, plain or encrypted.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{NamespaceError, Result};
use crate::inode::Inode;
use crate::name_codec::{
    decode_encrypted_symlink, decode_plain_symlink, encode_encrypted_symlink,
    encode_plain_symlink,
};
use crate::namespace::Namespace;
use crate::types::{Credentials, FileType, InodeFlags, OpsKind};

impl Namespace {
    /// Creates a symlink to `target`. Inside an encrypted directory the
    /// target is stored encrypted and the policy key must be loaded.
    pub fn symlink(
        &self,
        dir: &Inode,
        name: &str,
        target: &str,
        creds: Credentials,
    ) -> Result<Arc<Inode>> {
        self.require_dir(dir)?;
        self.check_new_name(dir, name)?;
        if target.is_empty() {
            return Err(NamespaceError::InvalidArgument(
                "empty symlink target".to_string(),
            ));
        }
        let block = self.config.block_bytes();
        if target.len() + 1 > block {
            return Err(NamespaceError::NameTooLong {
                len: target.len() + 1,
                max: block,
            });
        }

        let inode = self.new_inode(dir, FileType::Symlink, 0o777, creds)?;
        let page = match self.encode_link_page(&inode, target, block) {
            Ok(page) => page,
            Err(e) => {
                let guard = self.lock();
                self.fail_inode_locked(&guard, &inode);
                return Err(e);
            }
        };
        inode.update(|a| a.size = target.len() as u64);

        let guard = self.lock();
        let linked = self
            .backend
            .pages
            .write_link(inode.ino(), page.clone())
            .and_then(|_| self.add_link_locked(&guard, dir, name, &inode));
        if let Err(e) = linked {
            self.fail_inode_locked(&guard, &inode);
            return Err(e);
        }
        drop(guard);

        self.backend.nids.finalize(inode.ino());
        if let Err(e) = self.backend.flusher.write_back_link(inode.ino(), page.len()) {
            warn!(ino = %inode.ino(), error = %e, "symlink write-back failed");
        }
        self.sync_dirs(&[dir]);
        debug!(parent = %dir.ino(), ino = %inode.ino(), name, len = target.len(), "created symlink");
        Ok(inode)
    }

    fn encode_link_page(&self, inode: &Inode, target: &str, block: usize) -> Result<Vec<u8>> {
        match inode.read(|a| a.ops) {
            OpsKind::EncryptedSymlink => {
                let policy = inode
                    .read(|a| a.policy)
                    .ok_or_else(|| NamespaceError::Corrupted(format!("{} has no policy", inode.ino())))?;
                let ciphertext = self.backend.crypto.encrypt(policy, target.as_bytes())?;
                encode_encrypted_symlink(&ciphertext, block)
            }
            _ => Ok(encode_plain_symlink(target)),
        }
    }

    /// Reads the target of a symlink, decrypting it when needed.
    pub fn get_link(&self, inode: &Inode) -> Result<String> {
        let (ops, policy) = inode.read(|a| (a.ops, a.policy));
        let page = match ops {
            OpsKind::Symlink | OpsKind::EncryptedSymlink => self.backend.pages.read_link(inode.ino())?,
            _ => {
                return Err(NamespaceError::InvalidArgument(format!(
                    "{} is not a symlink",
                    inode.ino()
                )))
            }
        };

        let target = if ops == OpsKind::EncryptedSymlink {
            let policy = policy.ok_or_else(|| {
                NamespaceError::Corrupted(format!("encrypted symlink {} has no policy", inode.ino()))
            })?;
            if !self.backend.crypto.has_key(policy) {
                return Err(NamespaceError::KeyUnavailable);
            }
            let ciphertext = decode_encrypted_symlink(&page, self.config.block_bytes())?;
            if ciphertext.is_empty() {
                return Err(NamespaceError::BrokenSymlink(inode.ino()));
            }
            self.backend.crypto.decrypt(policy, ciphertext)?
        } else {
            decode_plain_symlink(&page).to_vec()
        };

        if target.is_empty() {
            return Err(NamespaceError::BrokenSymlink(inode.ino()));
        }
        String::from_utf8(target).map_err(|_| {
            NamespaceError::Corrupted(format!("symlink {} target is not UTF-8", inode.ino()))
        })
    }

    /// Returns true when the inode is a symlink whose target sits in its
    /// inline area.
    pub fn is_inline_symlink(&self, inode: &Inode) -> bool {
        inode.file_type() == FileType::Symlink && inode.has(InodeFlags::INLINE_DATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::NamespaceConfig;
    use crate::crypt::{KeyMaterial, KeyringCrypto};
    use crate::flush::CountingFlusher;
    use crate::types::PolicyId;

    fn setup(config: NamespaceConfig) -> (Namespace, Arc<KeyringCrypto>, Arc<CountingFlusher>) {
        let crypto = Arc::new(KeyringCrypto::new(KeyMaterial([8u8; 32])));
        let flusher = Arc::new(CountingFlusher::new());
        let backend = Backend::in_memory(&config, crypto.clone()).with_flusher(flusher.clone());
        (Namespace::format(config, backend).unwrap(), crypto, flusher)
    }

    fn encrypted_dir(ns: &Namespace, crypto: &KeyringCrypto, policy: u64) -> Arc<Inode> {
        let root = ns.root().unwrap();
        let dir = ns.mkdir(&root, "vault", 0o700, Credentials::root()).unwrap();
        dir.update(|a| {
            a.flags.insert(InodeFlags::ENCRYPTED);
            a.policy = Some(PolicyId::new(policy));
        });
        crypto.add_key(PolicyId::new(policy)).unwrap();
        dir
    }

    #[test]
    fn test_plain_symlink() {
        let (ns, _, flusher) = setup(NamespaceConfig::default());
        let root = ns.root().unwrap();
        let link = ns.symlink(&root, "l", "/a/b/c", Credentials::root()).unwrap();
        assert_eq!(link.attr().size, 6);
        assert!(ns.is_inline_symlink(&link));
        assert_eq!(ns.get_link(&link).unwrap(), "/a/b/c");
        assert_eq!(flusher.link_writebacks(), 1);
    }

    #[test]
    fn test_symlink_target_limits() {
        let (ns, _, _) = setup(NamespaceConfig {
            block_size: 512,
            ..Default::default()
        });
        let root = ns.root().unwrap();
        ns.symlink(&root, "fits", &"t".repeat(511), Credentials::root())
            .unwrap();
        match ns.symlink(&root, "long", &"t".repeat(512), Credentials::root()) {
            Err(NamespaceError::NameTooLong { len, max }) => {
                assert_eq!(len, 513);
                assert_eq!(max, 512);
            }
            other => panic!("expected NameTooLong, got {:?}", other),
        }
        assert!(matches!(
            ns.symlink(&root, "empty", "", Credentials::root()),
            Err(NamespaceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_encrypted_symlink_roundtrip() {
        let (ns, crypto, _) = setup(NamespaceConfig::default());
        let dir = encrypted_dir(&ns, &crypto, 11);
        let link = ns.symlink(&dir, "l", "/a/b/c", Credentials::root()).unwrap();
        assert_eq!(link.attr().ops, OpsKind::EncryptedSymlink);

        let stored = ns.backend.pages.read_link(link.ino()).unwrap();
        assert!(!stored.windows(6).any(|w| w == b"/a/b/c"));
        assert_eq!(ns.get_link(&link).unwrap(), "/a/b/c");

        crypto.remove_key(PolicyId::new(11));
        assert!(matches!(
            ns.get_link(&link),
            Err(NamespaceError::KeyUnavailable)
        ));
    }

    #[test]
    fn test_encrypted_symlink_container_too_long() {
        let (ns, crypto, _) = setup(NamespaceConfig {
            block_size: 512,
            ..Default::default()
        });
        let dir = encrypted_dir(&ns, &crypto, 12);
        let cached = ns.cached_inodes();
        // 500 bytes of plaintext grow past the block once sealed.
        assert!(matches!(
            ns.symlink(&dir, "l", &"x".repeat(500), Credentials::root()),
            Err(NamespaceError::NameTooLong { .. })
        ));
        assert_eq!(ns.cached_inodes(), cached);
        assert!(ns.lookup(&dir, "l").unwrap().is_none());
    }

    #[test]
    fn test_encrypted_symlink_without_key() {
        let (ns, crypto, _) = setup(NamespaceConfig::default());
        let dir = encrypted_dir(&ns, &crypto, 13);
        crypto.remove_key(PolicyId::new(13));
        assert!(matches!(
            ns.symlink(&dir, "l", "/x", Credentials::root()),
            Err(NamespaceError::KeyUnavailable)
        ));
    }

    #[test]
    fn test_broken_encrypted_symlink() {
        let (ns, crypto, _) = setup(NamespaceConfig::default());
        let dir = encrypted_dir(&ns, &crypto, 14);
        let link = ns.symlink(&dir, "l", "/x", Credentials::root()).unwrap();

        ns.backend.pages.write_link(link.ino(), vec![0, 0, 0]).unwrap();
        assert!(matches!(
            ns.get_link(&link),
            Err(NamespaceError::BrokenSymlink(_))
        ));

        ns.backend.pages.write_link(link.ino(), vec![0xff, 0x0f, 1, 2]).unwrap();
        assert!(matches!(ns.get_link(&link), Err(NamespaceError::Corrupted(_))));
    }

    #[test]
    fn test_get_link_on_regular_file() {
        let (ns, _, _) = setup(NamespaceConfig::default());
        let root = ns.root().unwrap();
        let file = ns.create(&root, "f", 0o644, Credentials::root()).unwrap();
        assert!(matches!(
            ns.get_link(&file),
            Err(NamespaceError::InvalidArgument(_))
        ));
    }
}
