use super::file_storage::{FileStorage, IndexStorage};
use super::format::{FormatError, Record};
use super::lock::StorageLock;
use crate::commit::{CommitId, CommitIndex};
use crate::hash::Hash;
use crate::refs::VcsRef;
use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash as StdHash;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const INDEX_FILE_NAME: &str = "commits.idx";

/// Bidirectional `(hash, root) <-> index` mapping, plus the same for refs.
/// Indices are allocated on first sight and never reused.
pub trait CommitIndexStore: Send + Sync {
    /// Index of the commit, allocating one if it was never seen
    fn index_of(&self, hash: &Hash, root: &Path) -> CommitIndex;

    fn id_of(&self, index: CommitIndex) -> Option<CommitId>;

    /// Missing indices are simply absent from the result
    fn ids_of(&self, indices: &[CommitIndex]) -> HashMap<CommitIndex, CommitId> {
        indices
            .iter()
            .filter_map(|&index| self.id_of(index).map(|id| (index, id)))
            .collect()
    }

    /// Scan all known commits until `visitor` returns false.
    /// Returns true if the scan ran to completion.
    fn iterate(&self, visitor: &mut dyn FnMut(CommitIndex, &CommitId) -> bool) -> bool;

    fn contains_commit(&self, id: &CommitId) -> bool;

    fn ref_index_of(&self, vcs_ref: &VcsRef) -> u32;

    fn ref_of(&self, index: u32) -> Option<VcsRef>;

    fn flush(&self) -> Result<()>;

    fn is_persistent(&self) -> bool;
}

/// Lock-free reads, internally synchronized allocation
struct InternTable<K: Eq + StdHash + Clone> {
    forward: DashMap<K, u32>,
    reverse: DashMap<u32, K>,
    next: AtomicU32,
}

impl<K: Eq + StdHash + Clone> InternTable<K> {
    fn new() -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            next: AtomicU32::new(0),
        }
    }

    /// Returns the index and whether it was freshly allocated
    fn intern(&self, key: K) -> (u32, bool) {
        if let Some(index) = self.forward.get(&key) {
            return (*index, false);
        }

        match self.forward.entry(key) {
            Entry::Occupied(entry) => (*entry.get(), false),
            Entry::Vacant(entry) => {
                let index = self.next.fetch_add(1, Ordering::SeqCst);
                self.reverse.insert(index, entry.key().clone());
                entry.insert(index);
                (index, true)
            }
        }
    }

    /// Restore a persisted mapping
    fn restore(&self, index: u32, key: K) -> Result<(), FormatError> {
        if let Some(existing) = self.reverse.get(&index) {
            if *existing != key {
                return Err(FormatError::ConflictingIndex { index });
            }
            return Ok(());
        }
        if self.forward.contains_key(&key) {
            return Err(FormatError::ConflictingIndex { index });
        }
        let next = index
            .checked_add(1)
            .ok_or(FormatError::IndexOverflow { index })?;

        self.reverse.insert(index, key.clone());
        self.forward.insert(key, index);
        self.next.fetch_max(next, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, index: u32) -> Option<K> {
        self.reverse.get(&index).map(|key| key.clone())
    }

    fn contains(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    fn len(&self) -> usize {
        self.reverse.len()
    }

    fn clear(&self) {
        self.forward.clear();
        self.reverse.clear();
        self.next.store(0, Ordering::SeqCst);
    }
}

/// Non-persistent store; also the fallback when storage is unusable
pub struct InMemoryIndexStore {
    commits: InternTable<CommitId>,
    refs: InternTable<VcsRef>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self {
            commits: InternTable::new(),
            refs: InternTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.len() == 0
    }
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitIndexStore for InMemoryIndexStore {
    fn index_of(&self, hash: &Hash, root: &Path) -> CommitIndex {
        self.commits.intern(CommitId::new(hash.clone(), root)).0
    }

    fn id_of(&self, index: CommitIndex) -> Option<CommitId> {
        self.commits.get(index)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(CommitIndex, &CommitId) -> bool) -> bool {
        iterate_table(&self.commits, visitor)
    }

    fn contains_commit(&self, id: &CommitId) -> bool {
        self.commits.contains(id)
    }

    fn ref_index_of(&self, vcs_ref: &VcsRef) -> u32 {
        self.refs.intern(vcs_ref.clone()).0
    }

    fn ref_of(&self, index: u32) -> Option<VcsRef> {
        self.refs.get(index)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

fn iterate_table(
    table: &InternTable<CommitId>,
    visitor: &mut dyn FnMut(CommitIndex, &CommitId) -> bool,
) -> bool {
    // snapshot first so the visitor never runs while a shard lock is held
    let mut entries: Vec<(CommitIndex, CommitId)> = table
        .reverse
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();
    entries.sort_by_key(|(index, _)| *index);

    entries.iter().all(|(index, id)| visitor(*index, id))
}

/// Store backed by an append-only record file
pub struct PersistentIndexStore {
    commits: InternTable<CommitId>,
    refs: InternTable<VcsRef>,
    storage: Mutex<FileStorage>,
    _lock: StorageLock,
}

impl PersistentIndexStore {
    /// Open the store in `dir`. A corrupted file is reset and the mapping rebuilt from scratch.
    pub fn open(dir: &Path) -> Result<Self> {
        let lock = StorageLock::acquire(dir)?;
        let path = dir.join(INDEX_FILE_NAME);

        let storage = match FileStorage::open(&path) {
            Ok(storage) => storage,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "index_store.corrupted_rebuilding");
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                FileStorage::open(&path)?
            }
        };

        let store = Self {
            commits: InternTable::new(),
            refs: InternTable::new(),
            storage: Mutex::new(storage),
            _lock: lock,
        };

        if let Err(err) = store.load() {
            warn!(path = %path.display(), error = %err, "index_store.corrupted_rebuilding");
            store.commits.clear();
            store.refs.clear();
            store.storage.lock().reset()?;
        }

        info!(
            path = %path.display(),
            commits = store.commits.len(),
            refs = store.refs.len(),
            "index_store.opened"
        );
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let mut failure: Option<FormatError> = None;
        self.storage.lock().enumerate(&mut |record| {
            let result = match record {
                Record::Commit { index, root, hash } => self
                    .commits
                    .restore(*index, CommitId::new(hash.clone(), root.clone())),
                Record::Ref {
                    index,
                    root,
                    hash,
                    name,
                    kind,
                } => self.refs.restore(
                    *index,
                    VcsRef::new(hash.clone(), name.clone(), *kind, root.clone()),
                ),
            };
            match result {
                Ok(()) => true,
                Err(err) => {
                    failure = Some(err);
                    false
                }
            }
        })?;

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn persist(&self, record: Record) {
        if let Err(err) = self.storage.lock().append(&record) {
            // mapping stays valid in memory, it just won't survive a restart
            warn!(error = %err, "index_store.append_failed");
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.len() == 0
    }
}

impl CommitIndexStore for PersistentIndexStore {
    fn index_of(&self, hash: &Hash, root: &Path) -> CommitIndex {
        let (index, fresh) = self.commits.intern(CommitId::new(hash.clone(), root));
        if fresh {
            self.persist(Record::Commit {
                index,
                root: root.to_path_buf(),
                hash: hash.clone(),
            });
        }
        index
    }

    fn id_of(&self, index: CommitIndex) -> Option<CommitId> {
        self.commits.get(index)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(CommitIndex, &CommitId) -> bool) -> bool {
        iterate_table(&self.commits, visitor)
    }

    fn contains_commit(&self, id: &CommitId) -> bool {
        self.commits.contains(id)
    }

    fn ref_index_of(&self, vcs_ref: &VcsRef) -> u32 {
        let (index, fresh) = self.refs.intern(vcs_ref.clone());
        if fresh {
            self.persist(Record::Ref {
                index,
                root: vcs_ref.root.clone(),
                hash: vcs_ref.hash.clone(),
                name: vcs_ref.name.clone(),
                kind: vcs_ref.kind,
            });
        }
        index
    }

    fn ref_of(&self, index: u32) -> Option<VcsRef> {
        self.refs.get(index)
    }

    fn flush(&self) -> Result<()> {
        self.storage.lock().flush()
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Open the persistent store in `dir`, falling back to memory if storage is unusable.
/// Never fails.
pub fn open_index_store(dir: &Path) -> Arc<dyn CommitIndexStore> {
    match PersistentIndexStore::open(dir) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(
                dir = %dir.display(),
                error = %err,
                "index_store.fallback_in_memory"
            );
            Arc::new(InMemoryIndexStore::new())
        }
    }
}

/// Translate provider hashes into indices, allocating as needed
pub fn index_all<'a>(
    store: &dyn CommitIndexStore,
    root: &Path,
    hashes: impl IntoIterator<Item = &'a Hash>,
) -> Vec<CommitIndex> {
    let indices: Vec<CommitIndex> = hashes
        .into_iter()
        .map(|hash| store.index_of(hash, root))
        .collect();
    debug!(root = %root.display(), count = indices.len(), "index_store.indexed");
    indices
}
