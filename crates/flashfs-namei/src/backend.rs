//! The set of collaborators a namespace runs on.

use std::sync::Arc;

use tracing::info;

use crate::config::NamespaceConfig;
use crate::crypt::EncryptionProvider;
use crate::entry_index::{EntryIndex, KvEntryIndex};
use crate::error::Result;
use crate::flush::{CountingFlusher, Flusher};
use crate::inode_store::InodeStore;
use crate::kvstore::{KvStore, MemoryKvStore};
use crate::nid::{MemoryNidAllocator, NidAllocator};
use crate::orphan::{self, MemoryOrphanRegistry, OrphanRegistry};

/// Storage, allocation, orphan, crypto and flush collaborators.
#[derive(Clone)]
pub struct Backend {
    /// Persistent store everything below writes into.
    pub kv: Arc<dyn KvStore>,
    /// Inode metadata pages.
    pub pages: InodeStore,
    /// Directory entries.
    pub entries: Arc<dyn EntryIndex>,
    /// Identifier allocator.
    pub nids: Arc<dyn NidAllocator>,
    /// Orphan registry.
    pub orphans: Arc<dyn OrphanRegistry>,
    /// Encryption provider.
    pub crypto: Arc<dyn EncryptionProvider>,
    /// Flush collaborator.
    pub flusher: Arc<dyn Flusher>,
}

impl Backend {
    /// Fresh in-memory collaborators over an empty store.
    pub fn in_memory(config: &NamespaceConfig, crypto: Arc<dyn EncryptionProvider>) -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        Self {
            pages: InodeStore::new(kv.clone()),
            entries: Arc::new(KvEntryIndex::new(kv.clone())),
            nids: Arc::new(MemoryNidAllocator::new(config.first_ino, config.max_inodes)),
            orphans: Arc::new(MemoryOrphanRegistry::new(config.max_orphans)),
            crypto,
            flusher: Arc::new(CountingFlusher::new()),
            kv,
        }
    }

    /// Rebuilds the collaborators from what `kv` holds, as after a power cut:
    /// the allocator resumes past the highest persisted inode and the orphan
    /// registry is read back from the last checkpoint.
    pub fn reopen(
        kv: Arc<dyn KvStore>,
        config: &NamespaceConfig,
        crypto: Arc<dyn EncryptionProvider>,
    ) -> Result<Self> {
        let pages = InodeStore::new(kv.clone());
        let nids = MemoryNidAllocator::new(config.first_ino, config.max_inodes);
        if let Some(max) = pages.max_ino()? {
            nids.resume(max);
        }
        let orphan_ids = orphan::load_checkpoint(kv.as_ref())?;
        info!(orphans = orphan_ids.len(), "backend reopened");
        Ok(Self {
            pages,
            entries: Arc::new(KvEntryIndex::new(kv.clone())),
            nids: Arc::new(nids),
            orphans: Arc::new(MemoryOrphanRegistry::from_ids(config.max_orphans, orphan_ids)),
            crypto,
            flusher: Arc::new(CountingFlusher::new()),
            kv,
        })
    }

    /// Replaces the entry index.
    pub fn with_entries(mut self, entries: Arc<dyn EntryIndex>) -> Self {
        self.entries = entries;
        self
    }

    /// Replaces the flush collaborator.
    pub fn with_flusher(mut self, flusher: Arc<dyn Flusher>) -> Self {
        self.flusher = flusher;
        self
    }
}
