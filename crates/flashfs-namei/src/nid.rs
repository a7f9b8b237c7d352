//! Inode identifier allocation.
//!
//! An identifier handed out by `allocate_id` is in flight until the creating
//! operation either `finalize`s it (the inode became reachable) or
//! `release`s it (the operation failed). Evicted inodes release their
//! identifier too, so it can be reused with a new generation.

use std::collections::{BTreeSet, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{NamespaceError, Result};
use crate::types::InodeId;

/// Issues unique inode identifiers.
pub trait NidAllocator: Send + Sync {
    /// Hands out an unused identifier; `NoSpace` when exhausted.
    fn allocate_id(&self) -> Result<InodeId>;

    /// Marks an in-flight identifier as owned by a live inode.
    fn finalize(&self, ino: InodeId);

    /// Returns an identifier to the free pool.
    fn release(&self, ino: InodeId);
}

struct NidState {
    next: u64,
    free: BTreeSet<u64>,
    in_flight: HashSet<u64>,
}

/// Bounded in-memory allocator.
pub struct MemoryNidAllocator {
    first: u64,
    limit: u64,
    state: Mutex<NidState>,
}

impl MemoryNidAllocator {
    /// Creates an allocator handing out `count` identifiers starting at `first`.
    pub fn new(first: u64, count: u64) -> Self {
        Self {
            first,
            limit: first.saturating_add(count),
            state: Mutex::new(NidState {
                next: first,
                free: BTreeSet::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    /// Skips every identifier up to and including `max_used`.
    pub fn resume(&self, max_used: InodeId) {
        let mut state = self.state.lock();
        let candidate = max_used.as_u64().saturating_add(1).max(self.first);
        if candidate > state.next {
            state.next = candidate;
        }
    }

    /// Number of identifiers allocated but neither finalized nor released.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl NidAllocator for MemoryNidAllocator {
    fn allocate_id(&self) -> Result<InodeId> {
        let mut state = self.state.lock();
        let id = match state.free.pop_first() {
            Some(id) => id,
            None if state.next < self.limit => {
                let id = state.next;
                state.next += 1;
                id
            }
            None => return Err(NamespaceError::NoSpace),
        };
        state.in_flight.insert(id);
        Ok(InodeId::new(id))
    }

    fn finalize(&self, ino: InodeId) {
        self.state.lock().in_flight.remove(&ino.as_u64());
    }

    fn release(&self, ino: InodeId) {
        let id = ino.as_u64();
        if id < self.first || id >= self.limit {
            return;
        }
        let mut state = self.state.lock();
        state.in_flight.remove(&id);
        if id < state.next {
            state.free.insert(id);
        }
        debug!(ino = %ino, "identifier released");
    }
}
