//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use flashfs_namei::kvstore::{BatchOp, KvPair, Value};
use flashfs_namei::{
    Backend, CountingFlusher, DirEntry, EntryIndex, FileType, InodeId, KeyMaterial,
    KeyringCrypto, KvEntryIndex, KvStore, MemoryKvStore, NamePolicy, Namespace, NamespaceConfig,
    NamespaceError, Result,
};
use parking_lot::Mutex;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// KV store that can be told to fail puts under a key prefix.
#[derive(Clone, Default)]
pub struct FaultyKv {
    inner: MemoryKvStore,
    prefix: Arc<Mutex<Option<Vec<u8>>>>,
    remaining: Arc<AtomicUsize>,
}

impl FaultyKv {
    pub fn new(inner: MemoryKvStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Lets `after` matching puts through, then fails every later one.
    pub fn fail_puts(&self, prefix: &[u8], after: usize) {
        self.remaining.store(after, Ordering::SeqCst);
        *self.prefix.lock() = Some(prefix.to_vec());
    }

    pub fn heal(&self) {
        *self.prefix.lock() = None;
    }

    fn check(&self, key: &[u8]) -> Result<()> {
        let armed = self.prefix.lock();
        match armed.as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                let left = self.remaining.load(Ordering::SeqCst);
                if left == 0 {
                    return Err(NamespaceError::Store("injected put failure".to_string()));
                }
                self.remaining.store(left - 1, Ordering::SeqCst);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl KvStore for FaultyKv {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.inner.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check(&key)?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>> {
        self.inner.scan_prefix(prefix)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.inner.contains_key(key)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        for op in &ops {
            if let BatchOp::Put { key, .. } = op {
                self.check(key)?;
            }
        }
        self.inner.write_batch(ops)
    }
}

/// Entry index that fails the n-th retarget once armed.
pub struct FaultyEntries {
    inner: KvEntryIndex,
    armed: AtomicBool,
    retargets_left: AtomicUsize,
}

impl FaultyEntries {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            inner: KvEntryIndex::new(kv),
            armed: AtomicBool::new(false),
            retargets_left: AtomicUsize::new(0),
        }
    }

    /// Lets `after` retargets succeed, then fails the next one.
    pub fn fail_retarget(&self, after: usize) {
        self.retargets_left.store(after, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl EntryIndex for FaultyEntries {
    fn find(&self, dir: InodeId, name: &str, policy: NamePolicy) -> Result<Option<DirEntry>> {
        self.inner.find(dir, name, policy)
    }

    fn insert(&self, dir: InodeId, entry: &DirEntry, policy: NamePolicy) -> Result<()> {
        self.inner.insert(dir, entry, policy)
    }

    fn remove(&self, dir: InodeId, entry: &DirEntry) -> Result<()> {
        self.inner.remove(dir, entry)
    }

    fn retarget(
        &self,
        dir: InodeId,
        entry: &DirEntry,
        ino: InodeId,
        file_type: FileType,
    ) -> Result<DirEntry> {
        if self.armed.load(Ordering::SeqCst) {
            let left = self.retargets_left.load(Ordering::SeqCst);
            if left == 0 {
                self.armed.store(false, Ordering::SeqCst);
                return Err(NamespaceError::Store("injected retarget failure".to_string()));
            }
            self.retargets_left.store(left - 1, Ordering::SeqCst);
        }
        self.inner.retarget(dir, entry, ino, file_type)
    }

    fn list(&self, dir: InodeId) -> Result<Vec<DirEntry>> {
        self.inner.list(dir)
    }
}

/// A formatted namespace plus handles on its collaborators.
pub struct Fixture {
    pub ns: Namespace,
    pub config: NamespaceConfig,
    pub store: MemoryKvStore,
    pub kv: FaultyKv,
    pub entries: Arc<FaultyEntries>,
    pub crypto: Arc<KeyringCrypto>,
    pub flusher: Arc<CountingFlusher>,
}

pub fn test_crypto() -> Arc<KeyringCrypto> {
    Arc::new(KeyringCrypto::new(KeyMaterial([42u8; 32])))
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(NamespaceConfig::default())
    }

    pub fn with_config(config: NamespaceConfig) -> Self {
        init_tracing();
        let store = MemoryKvStore::new();
        let kv = FaultyKv::new(store.clone());
        let shared: Arc<dyn KvStore> = Arc::new(kv.clone());
        let entries = Arc::new(FaultyEntries::new(shared.clone()));
        let crypto = test_crypto();
        let flusher = Arc::new(CountingFlusher::new());
        let backend = Backend::reopen(shared, &config, crypto.clone())
            .unwrap()
            .with_entries(entries.clone())
            .with_flusher(flusher.clone());
        let ns = Namespace::format(config.clone(), backend).unwrap();
        Self {
            ns,
            config,
            store,
            kv,
            entries,
            crypto,
            flusher,
        }
    }

    /// Drops every in-memory structure and mounts again over what the store
    /// holds, as after a power cut.
    pub fn remount(self) -> Namespace {
        let Fixture {
            ns, config, store, ..
        } = self;
        drop(ns);
        let backend = Backend::reopen(Arc::new(store), &config, test_crypto()).unwrap();
        Namespace::mount(config, backend).unwrap()
    }

    /// Names in `dir`, dot entries excluded.
    pub fn names(&self, dir: InodeId) -> Vec<String> {
        self.ns
            .backend()
            .entries
            .list(dir)
            .unwrap()
            .into_iter()
            .filter(|e| !e.is_dot())
            .map(|e| e.name)
            .collect()
    }
}

/// Walks the tree from the root and checks that every persisted link count
/// equals the number of entries naming the inode, dot entries included.
pub fn assert_link_counts(ns: &Namespace) {
    use std::collections::{BTreeMap, VecDeque};

    let backend = ns.backend();
    let mut counts: BTreeMap<InodeId, u32> = BTreeMap::new();
    let mut queue = VecDeque::from([ns.root_ino()]);
    while let Some(dir) = queue.pop_front() {
        for entry in backend.entries.list(dir).unwrap() {
            *counts.entry(entry.ino).or_default() += 1;
            if !entry.is_dot() && entry.file_type == FileType::Directory {
                queue.push_back(entry.ino);
            }
        }
    }
    for (ino, expected) in counts {
        let attr = backend.pages.get_inode(ino).unwrap();
        assert_eq!(attr.nlink, expected, "link count of {}", ino);
    }
}
