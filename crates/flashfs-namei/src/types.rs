//! Identifiers, inode records, directory entries and the flag sets shared
//! by every namespace operation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NamespaceError, Result};

/// Represents a unique identifier for an inode within one filesystem instance
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// Creates a new InodeId from a raw u64 value
    pub const fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the encryption policy an inode was created under
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(u64);

impl PolicyId {
    /// Creates a new PolicyId from a raw u64 value
    pub fn new(id: u64) -> Self {
        PolicyId(id)
    }

    /// Returns the raw u64 value of this policy ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// File type enumeration matching POSIX file types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

impl FileType {
    /// Returns the POSIX S_IFMT bits for this file type
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
            FileType::BlockDevice => 0o060000,
            FileType::CharDevice => 0o020000,
            FileType::Fifo => 0o010000,
            FileType::Socket => 0o140000,
        }
    }

    /// Whether an inode of this type can carry an encryption policy.
    pub fn may_encrypt(&self) -> bool {
        matches!(
            self,
            FileType::RegularFile | FileType::Directory | FileType::Symlink
        )
    }

    /// Whether mknod may create a node of this type.
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            FileType::BlockDevice | FileType::CharDevice | FileType::Fifo | FileType::Socket
        )
    }
}

/// Device number of a special inode, split into major and minor parts
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevId {
    /// Major device number
    pub major: u32,
    /// Minor device number
    pub minor: u32,
}

impl DevId {
    /// Device number carried by whiteout inodes.
    pub const WHITEOUT: DevId = DevId { major: 0, minor: 0 };

    /// Creates a device number.
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns true when the number fits the 12-bit major / 20-bit minor encoding.
    pub fn is_valid(&self) -> bool {
        self.major < (1 << 12) && self.minor < (1 << 20)
    }
}

/// Per-inode flag set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeFlags(u32);

impl InodeFlags {
    /// Small files may keep their data inside the inode page
    pub const INLINE_DATA: InodeFlags = InodeFlags(1 << 0);
    /// Small directories may keep their entries inside the inode page
    pub const INLINE_DENTRY: InodeFlags = InodeFlags(1 << 1);
    /// Directory lacks explicit `.` and `..` entries
    pub const INLINE_DOTS: InodeFlags = InodeFlags(1 << 2);
    /// Inode carries an encryption policy
    pub const ENCRYPTED: InodeFlags = InodeFlags(1 << 3);
    /// Data classified as cold (media files)
    pub const COLD: InodeFlags = InodeFlags(1 << 4);
    /// Name hint stored in the inode page is encrypted
    pub const ENC_NAME: InodeFlags = InodeFlags(1 << 5);
    /// Lookups in this directory compare names case-insensitively
    pub const CASEFOLD: InodeFlags = InodeFlags(1 << 6);
    /// Directory updates must be flushed synchronously
    pub const DIRSYNC: InodeFlags = InodeFlags(1 << 7);
    /// The next entry insertion bumps the link count
    pub const INC_LINK: InodeFlags = InodeFlags(1 << 8);
    /// Inode page has not been written yet
    pub const NEW_INODE: InodeFlags = InodeFlags(1 << 9);
    /// Identifier must be handed back to the allocator on eviction
    pub const PENDING_FREE: InodeFlags = InodeFlags(1 << 10);
    /// Inode is unusable and will be discarded
    pub const BAD: InodeFlags = InodeFlags(1 << 11);
    /// May be linked even though its link count is zero
    pub const LINKABLE: InodeFlags = InodeFlags(1 << 12);

    /// An empty flag set.
    pub const fn empty() -> Self {
        InodeFlags(0)
    }

    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: InodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: InodeFlags) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: InodeFlags) {
        self.0 &= !other.0;
    }

    /// Sets or clears the bits of `other`.
    pub fn set(&mut self, other: InodeFlags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for InodeFlags {
    type Output = InodeFlags;

    fn bitor(self, rhs: Self) -> Self {
        InodeFlags(self.0 | rhs.0)
    }
}

/// Which operation table serves an inode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpsKind {
    /// Regular file operations
    File,
    /// Directory (namespace) operations
    Directory,
    /// Plaintext symlink
    Symlink,
    /// Symlink whose target is stored in the encrypted container
    EncryptedSymlink,
    /// Device, fifo, socket and whiteout nodes
    Special,
}

impl OpsKind {
    /// Picks the table for a freshly created inode.
    pub fn for_new(file_type: FileType, encrypted: bool) -> Self {
        match file_type {
            FileType::RegularFile => OpsKind::File,
            FileType::Directory => OpsKind::Directory,
            FileType::Symlink if encrypted => OpsKind::EncryptedSymlink,
            FileType::Symlink => OpsKind::Symlink,
            _ => OpsKind::Special,
        }
    }
}

/// How names are compared inside a directory
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NamePolicy {
    /// Byte-exact comparison
    Exact,
    /// Trailing dots stripped, ASCII case folded
    CaseInsensitive,
}

/// Persisted inode metadata (the inode page).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode number
    pub ino: InodeId,
    /// File type
    pub file_type: FileType,
    /// Permission bits including set-uid/set-gid/sticky
    pub mode: u32,
    /// Hard link count
    pub nlink: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Device number for special inodes
    pub rdev: DevId,
    /// Last access time
    pub atime: Timestamp,
    /// Last modification time
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
    /// Generation number, distinguishes reuse of an identifier
    pub generation: u32,
    /// Flag set
    pub flags: InodeFlags,
    /// Encryption policy, present when ENCRYPTED is set
    pub policy: Option<PolicyId>,
    /// Parent the inode was last linked under, cleared when it may be stale
    pub parent_hint: Option<InodeId>,
    /// Name the inode was last linked under
    pub name_hint: Option<String>,
    /// Operation table
    pub ops: OpsKind,
}

impl InodeAttr {
    /// Creates attributes for a brand-new inode with one link.
    pub fn new(
        ino: InodeId,
        file_type: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        generation: u32,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            ino,
            file_type,
            mode: mode & 0o7777,
            nlink: 1,
            uid,
            gid,
            size: 0,
            rdev: DevId::default(),
            atime: now,
            mtime: now,
            ctime: now,
            generation,
            flags: InodeFlags::empty(),
            policy: None,
            parent_hint: None,
            name_hint: None,
            ops: OpsKind::for_new(file_type, false),
        }
    }

    /// Creates the root directory attributes.
    pub fn new_root(ino: InodeId, mode: u32) -> Self {
        let mut attr = Self::new(ino, FileType::Directory, mode, 0, 0, 0);
        attr.nlink = 2;
        attr.parent_hint = Some(ino);
        attr
    }

    /// Returns true if every bit of `flag` is set.
    pub fn has(&self, flag: InodeFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Name comparison policy for entries of this directory.
    pub fn name_policy(&self) -> NamePolicy {
        if self.has(InodeFlags::CASEFOLD) {
            NamePolicy::CaseInsensitive
        } else {
            NamePolicy::Exact
        }
    }

    /// Full POSIX mode including the S_IFMT bits.
    pub fn full_mode(&self) -> u32 {
        self.file_type.mode_bits() | self.mode
    }
}

/// Directory entry: a name bound to an inode inside one directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Child inode
    pub ino: InodeId,
    /// Type hint of the child
    pub file_type: FileType,
}

impl DirEntry {
    /// Creates an entry.
    pub fn new(name: impl Into<String>, ino: InodeId, file_type: FileType) -> Self {
        Self {
            name: name.into(),
            ino,
            file_type,
        }
    }

    /// True for the `.` and `..` entries.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Caller identity used to initialise ownership of new inodes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Filesystem user ID
    pub uid: u32,
    /// Filesystem group ID
    pub gid: u32,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The superuser.
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Flags accepted by rename.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RenameFlags(u32);

impl RenameFlags {
    /// Plain rename, replacing an existing target
    pub const NONE: RenameFlags = RenameFlags(0);
    /// Fail if the target exists
    pub const NOREPLACE: RenameFlags = RenameFlags(1 << 0);
    /// Atomically exchange source and target
    pub const EXCHANGE: RenameFlags = RenameFlags(1 << 1);
    /// Leave a whiteout at the source name
    pub const WHITEOUT: RenameFlags = RenameFlags(1 << 2);

    const ALL: u32 = 0b111;

    /// Parses raw flag bits, rejecting unknown bits and invalid combinations.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(NamespaceError::InvalidArgument(format!(
                "unknown rename flags {:#x}",
                bits
            )));
        }
        let flags = RenameFlags(bits);
        if flags.contains(Self::EXCHANGE)
            && (flags.contains(Self::NOREPLACE) || flags.contains(Self::WHITEOUT))
        {
            return Err(NamespaceError::InvalidArgument(
                "exchange cannot be combined with noreplace or whiteout".to_string(),
            ));
        }
        Ok(flags)
    }

    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: RenameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RenameFlags {
    type Output = RenameFlags;

    fn bitor(self, rhs: Self) -> Self {
        RenameFlags(self.0 | rhs.0)
    }
}
