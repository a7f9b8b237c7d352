//! Positive dentry cache for lock-free lookups.
//!
//! Buckets are keyed by `(parent, name_hash)` where the hash follows the
//! parent's name policy, so a case-insensitive directory finds `"FOO"` in
//! the bucket filled by `"foo."`.
//!
//! Lookups fill the cache without the ordering lock. Every invalidation
//! bumps an epoch before dropping the bucket; a fill started under an older
//! epoch is discarded, so an entry removed while a lookup was reading the
//! index never reappears.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::name_codec::{name_hash, names_equal};
use crate::types::{DirEntry, InodeId, NamePolicy};

/// Token returned by [`DentryCache::begin_fill`].
#[derive(Copy, Clone, Debug)]
pub struct FillToken(u64);

/// Cache of resolved directory entries.
#[derive(Default)]
pub struct DentryCache {
    buckets: DashMap<(InodeId, u64), Vec<DirEntry>>,
    epoch: AtomicU64,
}

impl DentryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks `name` up in `parent`.
    pub fn get(&self, parent: InodeId, name: &str, policy: NamePolicy) -> Option<DirEntry> {
        let bucket = self.buckets.get(&(parent, name_hash(name, policy)))?;
        bucket
            .iter()
            .find(|e| names_equal(&e.name, name, policy))
            .cloned()
    }

    /// Starts a fill; call before reading the entry index.
    pub fn begin_fill(&self) -> FillToken {
        FillToken(self.epoch.load(Ordering::SeqCst))
    }

    /// Records `entry` unless an invalidation ran since `token` was taken.
    pub fn fill(&self, token: FillToken, parent: InodeId, entry: &DirEntry, policy: NamePolicy) {
        let mut bucket = self
            .buckets
            .entry((parent, name_hash(&entry.name, policy)))
            .or_default();
        if self.epoch.load(Ordering::SeqCst) != token.0 {
            return;
        }
        if !bucket.iter().any(|e| names_equal(&e.name, &entry.name, policy)) {
            bucket.push(entry.clone());
        }
    }

    /// Forgets `name` in `parent`.
    pub fn invalidate(&self, parent: InodeId, name: &str, policy: NamePolicy) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.buckets.remove(&(parent, name_hash(name, policy)));
    }

    /// Forgets every entry of `parent`.
    pub fn invalidate_dir(&self, parent: InodeId) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.buckets.retain(|key, _| key.0 != parent);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.value().len()).sum()
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
