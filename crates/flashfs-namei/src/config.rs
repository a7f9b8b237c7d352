//! Mount-time configuration for the namespace layer.

use serde::{Deserialize, Serialize};

use crate::error::{NamespaceError, Result};

/// Largest supported block size.
const MAX_BLOCK_SIZE: u32 = 64 * 1024;

/// Media extensions whose files are placed in cold segments.
const DEFAULT_COLD_EXTENSIONS: &[&str] = &[
    "jpg", "gif", "png", "avi", "divx", "mp4", "mp3", "3gp", "wmv", "wma", "mpeg", "mkv", "mov",
    "asx", "asf", "wmx", "svi", "wvx", "wm", "mpg", "mpe", "rm", "ogg",
];

/// Configuration for a namespace instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Filesystem block size; bounds symlink targets.
    pub block_size: u32,
    /// Maximum length of a single name.
    pub max_name_len: usize,
    /// Link count ceiling.
    pub link_max: u32,
    /// Allow small regular files and symlinks to keep data inline.
    pub inline_data: bool,
    /// Allow small directories to keep entries inline.
    pub inline_dentry: bool,
    /// Create inline directories without explicit dot entries.
    pub legacy_inline_dots: bool,
    /// Flush after every directory mutation.
    pub dirsync: bool,
    /// Skip cold-file classification by extension.
    pub disable_ext_identify: bool,
    /// Extensions whose files are classified cold.
    pub cold_extensions: Vec<String>,
    /// Orphan registry capacity.
    pub max_orphans: usize,
    /// Number of identifiers the allocator may hand out.
    pub max_inodes: u64,
    /// Identifier of the root directory.
    pub root_ino: u64,
    /// First identifier handed out for ordinary inodes.
    pub first_ino: u64,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_name_len: 255,
            link_max: u32::MAX,
            inline_data: true,
            inline_dentry: true,
            legacy_inline_dots: false,
            dirsync: false,
            disable_ext_identify: false,
            cold_extensions: DEFAULT_COLD_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_orphans: 1020,
            max_inodes: 1 << 20,
            root_ino: 3,
            first_ino: 4,
        }
    }
}

impl NamespaceConfig {
    /// Rejects configurations the namespace cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(NamespaceError::InvalidArgument(format!(
                "block size {} out of range",
                self.block_size
            )));
        }
        if self.max_name_len == 0 {
            return Err(NamespaceError::InvalidArgument(
                "max_name_len must be positive".to_string(),
            ));
        }
        if self.max_inodes == 0 {
            return Err(NamespaceError::InvalidArgument(
                "max_inodes must be positive".to_string(),
            ));
        }
        if self.first_ino <= self.root_ino {
            return Err(NamespaceError::InvalidArgument(format!(
                "first_ino {} must follow root_ino {}",
                self.first_ino, self.root_ino
            )));
        }
        Ok(())
    }

    /// Block size as a byte count.
    pub fn block_bytes(&self) -> usize {
        self.block_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = NamespaceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_bytes(), 4096);
        assert!(config.cold_extensions.iter().any(|e| e == "mp4"));
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let config = NamespaceConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NamespaceError::InvalidArgument(_))
        ));
        let config = NamespaceConfig {
            block_size: 1 << 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_overlapping_ids() {
        let config = NamespaceConfig {
            root_ino: 4,
            first_ino: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
