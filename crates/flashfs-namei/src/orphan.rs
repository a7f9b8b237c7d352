//! Orphan registry: inodes with no links that still await reclamation.
//!
//! Slots are accounted separately from membership. A caller first
//! `reserve`s a slot before any entry mutation, then either `add`s the id
//! (consuming the slot) or `release`s the slot. `remove` drops a member and
//! its slot once the inode is reclaimed or relinked.
//!
//! The member set is persisted by a checkpoint under `ckpt/orphans` and read
//! back at mount so crashed-with-zero-links inodes are reclaimed.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{NamespaceError, Result};
use crate::kvstore::KvStore;
use crate::types::InodeId;

const CHECKPOINT_KEY: &[u8] = b"ckpt/orphans";

/// Process-wide set of inode ids pending reclamation.
pub trait OrphanRegistry: Send + Sync {
    /// Claims a slot; `NoSpace` when the registry is full.
    fn reserve(&self) -> Result<()>;

    /// Gives back a slot claimed by `reserve` that will not be used.
    fn release(&self);

    /// Records `ino` as an orphan, consuming a reserved slot.
    fn add(&self, ino: InodeId);

    /// Drops `ino` and its slot; no-op when absent.
    fn remove(&self, ino: InodeId);

    /// Returns true when `ino` is recorded.
    fn contains(&self, ino: InodeId) -> bool;

    /// Current members, ascending.
    fn snapshot(&self) -> Vec<InodeId>;
}

struct OrphanState {
    slots: usize,
    members: BTreeSet<InodeId>,
}

/// In-memory registry bounded by a slot count.
pub struct MemoryOrphanRegistry {
    max: usize,
    state: Mutex<OrphanState>,
}

impl MemoryOrphanRegistry {
    /// Creates an empty registry with room for `max` orphans.
    pub fn new(max: usize) -> Self {
        Self::from_ids(max, Vec::new())
    }

    /// Rebuilds a registry from a checkpointed member list.
    pub fn from_ids(max: usize, ids: Vec<InodeId>) -> Self {
        let members: BTreeSet<InodeId> = ids.into_iter().collect();
        Self {
            max,
            state: Mutex::new(OrphanState {
                slots: members.len(),
                members,
            }),
        }
    }

    /// Slots currently claimed, members included.
    pub fn slots_in_use(&self) -> usize {
        self.state.lock().slots
    }
}

impl OrphanRegistry for MemoryOrphanRegistry {
    fn reserve(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.slots >= self.max {
            warn!(max = self.max, "orphan registry full");
            return Err(NamespaceError::NoSpace);
        }
        state.slots += 1;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.slots = state.slots.saturating_sub(1);
    }

    fn add(&self, ino: InodeId) {
        let mut state = self.state.lock();
        if !state.members.insert(ino) {
            // Already recorded; the extra slot is not needed.
            state.slots = state.slots.saturating_sub(1);
        }
        debug!(ino = %ino, "orphan added");
    }

    fn remove(&self, ino: InodeId) {
        let mut state = self.state.lock();
        if state.members.remove(&ino) {
            state.slots = state.slots.saturating_sub(1);
            debug!(ino = %ino, "orphan removed");
        }
    }

    fn contains(&self, ino: InodeId) -> bool {
        self.state.lock().members.contains(&ino)
    }

    fn snapshot(&self) -> Vec<InodeId> {
        self.state.lock().members.iter().copied().collect()
    }
}

/// Persists the registry members into the checkpoint area.
pub fn store_checkpoint(kv: &dyn KvStore, registry: &dyn OrphanRegistry) -> Result<()> {
    let ids: Vec<u64> = registry.snapshot().iter().map(InodeId::as_u64).collect();
    let value = bincode::serialize(&ids).map_err(|e| NamespaceError::Store(e.to_string()))?;
    kv.put(CHECKPOINT_KEY.to_vec(), value)
}

/// Reads the members persisted by the last checkpoint.
pub fn load_checkpoint(kv: &dyn KvStore) -> Result<Vec<InodeId>> {
    match kv.get(CHECKPOINT_KEY)? {
        Some(value) => {
            let ids: Vec<u64> =
                bincode::deserialize(&value).map_err(|e| NamespaceError::Store(e.to_string()))?;
            Ok(ids.into_iter().map(InodeId::new).collect())
        }
        None => Ok(Vec::new()),
    }
}
