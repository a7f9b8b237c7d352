//! Error type for namespace operations and its POSIX errno mapping.

use thiserror::Error;

use crate::types::InodeId;

/// Errors surfaced by namespace operations.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// A directory entry with the given name was not found.
    #[error("entry '{name}' not found in directory {parent}")]
    EntryNotFound {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name that was not found
        name: String,
    },

    /// The requested inode does not exist or is no longer linked.
    #[error("inode {0} not found")]
    InodeNotFound(InodeId),

    /// A directory entry with the given name already exists.
    #[error("entry '{name}' already exists in directory {parent}")]
    AlreadyExists {
        /// Parent directory inode
        parent: InodeId,
        /// Existing entry name
        name: String,
    },

    /// Attempted to remove or replace a non-empty directory.
    #[error("directory {0} is not empty")]
    NotEmpty(InodeId),

    /// A directory was required.
    #[error("inode {0} is not a directory")]
    NotADirectory(InodeId),

    /// A non-directory was required.
    #[error("inode {0} is a directory")]
    IsADirectory(InodeId),

    /// No free inode identifier or orphan slot.
    #[error("no space left on device")]
    NoSpace,

    /// Memory allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Name or encoded symlink exceeds the allowed length.
    #[error("name too long: {len} > {max}")]
    NameTooLong {
        /// Offending length
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Encryption policies of parent and child are inconsistent, or the
    /// operation is not permitted on this inode.
    #[error("operation not permitted")]
    PermissionDenied,

    /// Link count would exceed the filesystem ceiling.
    #[error("too many links to inode {0}")]
    TooManyLinks(InodeId),

    /// On-disk structures are inconsistent.
    #[error("structure corrupted: {0}")]
    Corrupted(String),

    /// Symlink target decoded to nothing.
    #[error("symlink {0} is broken")]
    BrokenSymlink(InodeId),

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Identifier already present in the live-inode cache.
    #[error("inode {0} already present in inode cache")]
    InodeCollision(InodeId),

    /// The key for an encryption policy is not loaded.
    #[error("encryption key unavailable")]
    KeyUnavailable,

    /// The cipher failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// An error occurred in the backing store.
    #[error("store error: {0}")]
    Store(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NamespaceError>;

impl NamespaceError {
    /// Maps the error onto a POSIX errno value.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            NamespaceError::EntryNotFound { .. } => ENOENT,
            NamespaceError::InodeNotFound(_) => ENOENT,
            NamespaceError::AlreadyExists { .. } => EEXIST,
            NamespaceError::NotEmpty(_) => ENOTEMPTY,
            NamespaceError::NotADirectory(_) => ENOTDIR,
            NamespaceError::IsADirectory(_) => EISDIR,
            NamespaceError::NoSpace => ENOSPC,
            NamespaceError::OutOfMemory => ENOMEM,
            NamespaceError::NameTooLong { .. } => ENAMETOOLONG,
            NamespaceError::PermissionDenied => EPERM,
            NamespaceError::TooManyLinks(_) => EMLINK,
            NamespaceError::Corrupted(_) => EIO,
            NamespaceError::BrokenSymlink(_) => ENOENT,
            NamespaceError::InvalidArgument(_) => EINVAL,
            NamespaceError::InodeCollision(_) => EINVAL,
            NamespaceError::KeyUnavailable => ENOKEY,
            NamespaceError::Crypto(_) => EIO,
            NamespaceError::Store(_) => EIO,
            NamespaceError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }
}
