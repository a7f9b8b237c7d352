//! Durability requests issued after a namespace operation drops the
//! ordering lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::types::InodeId;

/// Storage flush collaborator.
pub trait Flusher: Send + Sync {
    /// Flushes all dirty metadata.
    fn sync_fs(&self) -> Result<()>;

    /// Writes back the first `len` bytes of a symlink's data page.
    fn write_back_link(&self, ino: InodeId, len: usize) -> Result<()>;
}

/// Flusher that only counts requests.
#[derive(Debug, Default)]
pub struct CountingFlusher {
    syncs: AtomicU64,
    link_writebacks: AtomicU64,
}

impl CountingFlusher {
    /// Creates a flusher with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `sync_fs` calls.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Number of `write_back_link` calls.
    pub fn link_writebacks(&self) -> u64 {
        self.link_writebacks.load(Ordering::Relaxed)
    }
}

impl Flusher for CountingFlusher {
    fn sync_fs(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_back_link(&self, _ino: InodeId, _len: usize) -> Result<()> {
        self.link_writebacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
