#![warn(missing_docs)]

//! FlashFS namespace layer: turns directory-tree requests (create, link,
//! unlink, mkdir, rmdir, mknod, symlink, rename, exchange, tmpfile,
//! whiteout) into consistent inode and directory-entry updates, with link
//! counts, orphan tracking and encryption policy checks kept in step.

pub mod backend;
pub mod config;
pub mod crypt;
pub mod dcache;
pub mod entry_index;
pub mod error;
pub mod flush;
pub mod inode;
pub mod inode_store;
pub mod kvstore;
pub mod name_codec;
pub mod namespace;
pub mod nid;
pub mod orphan;
pub mod types;

mod bootstrap;
mod exchange;
mod link;
mod remove;
mod rename;
mod symlink;

pub use backend::Backend;
pub use config::NamespaceConfig;
pub use crypt::{EncryptionProvider, KeyMaterial, KeyringCrypto};
pub use entry_index::{EntryIndex, KvEntryIndex};
pub use error::{NamespaceError, Result};
pub use flush::{CountingFlusher, Flusher};
pub use inode::Inode;
pub use kvstore::{KvStore, MemoryKvStore};
pub use namespace::Namespace;
pub use nid::{MemoryNidAllocator, NidAllocator};
pub use orphan::{MemoryOrphanRegistry, OrphanRegistry};
pub use types::{
    Credentials, DevId, DirEntry, FileType, InodeAttr, InodeFlags, InodeId, NamePolicy, OpsKind,
    PolicyId, RenameFlags, Timestamp,
};
