// Detail cache - single-flight, placeholder-backed cache of commit details
//
// Requests that miss the cache get a Loading(generation) placeholder and a background
// task. One worker thread per cache drains a small LIFO queue of tasks; it is spawned
// when work arrives and exits when the queue is empty.

use crate::cancel::CancellationToken;
use crate::commit::{CommitId, CommitIndex};
use crate::details::Detail;
use crate::error::{is_cancellation, LogError};
use crate::hash::Hash;
use crate::storage::CommitIndexStore;
use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Backend fetch for one detail type
pub trait DetailFetcher<T>: Send + Sync + 'static {
    /// Load `hashes` of `root`, calling `on_each` per object found. Missing hashes are skipped.
    fn fetch(&self, root: &Path, hashes: &[Hash], on_each: &mut dyn FnMut(T)) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry<T> {
    Ready(T),
    /// Load in flight, started at this generation
    Loading(u64),
}

type Listener = Arc<dyn Fn() + Send + Sync>;

const REQUEST_THREADS: usize = 2;

struct Task {
    indices: Vec<CommitIndex>,
    generation: u64,
}

struct State<T> {
    entries: LruCache<CommitIndex, CacheEntry<T>>,
    generation: u64,
    queue: VecDeque<Task>,
    worker_active: bool,
    disposed: bool,
}

struct Shared<T, F> {
    store: Arc<dyn CommitIndexStore>,
    fetcher: F,
    state: Mutex<State<T>>,
    listeners: Mutex<Vec<Listener>>,
    cancel: CancellationToken,
    window: u64,
    queue_depth: usize,
    // explicit requests; None if the pool could not be built
    requests: Option<rayon::ThreadPool>,
}

pub struct DetailCache<T, F> {
    shared: Arc<Shared<T, F>>,
}

impl<T, F> Clone for DetailCache<T, F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Detail, F: DetailFetcher<T>> DetailCache<T, F> {
    /// `window` is how many generations a placeholder may lag before it is
    /// considered abandoned; `queue_depth` bounds the pending task queue.
    pub fn new(
        store: Arc<dyn CommitIndexStore>,
        fetcher: F,
        capacity: usize,
        window: u64,
        queue_depth: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let requests = match rayon::ThreadPoolBuilder::new()
            .num_threads(REQUEST_THREADS)
            .thread_name(|i| format!("vcs-log-request-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(error = %err, "details.request_pool.build_failed");
                None
            }
        };
        Self {
            shared: Arc::new(Shared {
                store,
                fetcher,
                state: Mutex::new(State {
                    entries: LruCache::new(capacity),
                    generation: 0,
                    queue: VecDeque::new(),
                    worker_active: false,
                    disposed: false,
                }),
                listeners: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                window: window.max(1),
                queue_depth: queue_depth.max(1),
                requests,
            }),
        }
    }

    /// Cached value, if loaded. Never blocks on I/O.
    pub fn get(&self, index: CommitIndex) -> Option<T> {
        match self.shared.state.lock().entries.get(&index) {
            Some(CacheEntry::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn entry(&self, index: CommitIndex) -> Option<CacheEntry<T>> {
        self.shared.state.lock().entries.peek(&index).cloned()
    }

    /// Cached value, or a placeholder while `index` (and any uncached `prefetch`
    /// ids) load in the background.
    pub fn get_or_load(&self, index: CommitIndex, prefetch: &[CommitIndex]) -> Result<T> {
        let id = self
            .shared
            .store
            .id_of(index)
            .ok_or(LogError::UnknownCommit(index))?;

        let spawn_worker = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(LogError::Disposed.into());
            }

            match state.entries.get(&index) {
                Some(CacheEntry::Ready(value)) => return Ok(value.clone()),
                Some(CacheEntry::Loading(_)) => return Ok(T::loading(id)),
                None => {}
            }

            state.generation += 1;
            let generation = state.generation;
            self.shared.evict_stale(&mut state);

            let mut indices = Vec::with_capacity(prefetch.len() + 1);
            for candidate in std::iter::once(index).chain(prefetch.iter().copied()) {
                if !state.entries.contains(&candidate) {
                    state.entries.put(candidate, CacheEntry::Loading(generation));
                    indices.push(candidate);
                }
            }

            state.queue.push_back(Task {
                indices,
                generation,
            });
            while state.queue.len() > self.shared.queue_depth {
                if let Some(dropped) = state.queue.pop_front() {
                    debug!(
                        generation = dropped.generation,
                        ids = dropped.indices.len(),
                        "details.task.superseded"
                    );
                }
            }

            !std::mem::replace(&mut state.worker_active, true)
        };

        if spawn_worker {
            self.spawn_worker();
        }
        Ok(T::loading(id))
    }

    /// Resolve `indices` on the calling thread, bypassing the queue. Ids the
    /// backend does not return are absent from the result.
    pub fn get_or_load_sync(&self, indices: &[CommitIndex]) -> Result<HashMap<CommitIndex, T>> {
        let mut result = HashMap::with_capacity(indices.len());
        let mut missing = Vec::new();
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(LogError::Disposed.into());
            }
            for &index in indices {
                match state.entries.get(&index) {
                    Some(CacheEntry::Ready(value)) => {
                        result.insert(index, value.clone());
                    }
                    _ => missing.push(index),
                }
            }
        }

        if missing.is_empty() {
            return Ok(result);
        }

        self.shared.load(&missing, &mut |index, value| {
            self.shared.store_loaded(index, value.clone());
            result.insert(index, value);
        })?;
        self.shared.cancel.check()?;
        Ok(result)
    }

    /// Load `indices` on the request pool and report through the callbacks.
    /// Values arrive in request order. Cancellation reports nothing.
    pub fn request_details<S, E>(&self, indices: Vec<CommitIndex>, on_success: S, on_error: E)
    where
        S: FnOnce(Vec<T>) + Send + 'static,
        E: FnOnce(anyhow::Error) + Send + 'static,
    {
        let cache = self.clone();
        let job = move || match cache.get_or_load_sync(&indices) {
            Ok(mut loaded) => {
                let values = indices.iter().filter_map(|i| loaded.remove(i)).collect();
                on_success(values);
            }
            Err(err) if is_cancellation(&err) || cache.is_disposed() => {
                debug!("details.request.cancelled");
            }
            Err(err) => on_error(err),
        };

        match &self.shared.requests {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }

    /// Called once after every background task, whether or not every id loaded
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared.listeners.lock().push(Arc::new(listener));
    }

    /// Drop placeholders that fell out of the generation window. Returns how many.
    pub fn clean_stale_placeholders(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.evict_stale(&mut state)
    }

    pub fn is_loading(&self) -> bool {
        let state = self.shared.state.lock();
        state.worker_active || !state.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Cancel the running task, drop queued ones and listeners. Nothing starts afterwards.
    pub fn dispose(&self) {
        self.shared.cancel.cancel();
        {
            let mut state = self.shared.state.lock();
            state.disposed = true;
            state.queue.clear();
        }
        self.shared.listeners.lock().clear();
        debug!("details.disposed");
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("vcs-log-details".to_string())
            .spawn(move || shared.run_worker());

        if let Err(err) = spawned {
            warn!(error = %err, "details.worker.spawn_failed");
            self.shared.state.lock().worker_active = false;
        }
    }
}

impl<T: Detail, F: DetailFetcher<T>> Shared<T, F> {
    fn run_worker(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                let next = if state.disposed {
                    None
                } else {
                    state.queue.pop_back()
                };
                match next {
                    Some(task) => task,
                    None => {
                        state.worker_active = false;
                        return;
                    }
                }
            };

            debug!(
                generation = task.generation,
                ids = task.indices.len(),
                "details.task.start"
            );

            let mut loaded = 0usize;
            let outcome = self.load(&task.indices, &mut |index, value| {
                if self.store_loaded(index, value) {
                    loaded += 1;
                }
            });

            match outcome {
                _ if self.cancel.is_cancelled() => {
                    debug!(generation = task.generation, "details.task.cancelled");
                    continue;
                }
                Err(err) if is_cancellation(&err) => {
                    debug!(generation = task.generation, "details.task.cancelled");
                    continue;
                }
                Err(err) => {
                    warn!(generation = task.generation, loaded, error = %err, "details.task.partial");
                }
                Ok(()) => {
                    debug!(generation = task.generation, loaded, "details.task.complete");
                }
            }

            let listeners: Vec<Listener> = self.listeners.lock().clone();
            for listener in listeners {
                listener();
            }
        }
    }

    /// Publish a loaded value unless the cache was disposed meanwhile
    fn store_loaded(&self, index: CommitIndex, value: T) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.state.lock().entries.put(index, CacheEntry::Ready(value));
        true
    }

    /// Fetch grouped by root. A failing root doesn't stop the others; the first
    /// error is returned once every root has been tried.
    fn load(
        &self,
        indices: &[CommitIndex],
        on_loaded: &mut dyn FnMut(CommitIndex, T),
    ) -> Result<()> {
        let ids = self.store.ids_of(indices);
        let mut by_root: BTreeMap<PathBuf, Vec<Hash>> = BTreeMap::new();
        let mut index_of: HashMap<CommitId, CommitIndex> = HashMap::with_capacity(ids.len());
        for (index, id) in ids {
            by_root
                .entry(id.root.clone())
                .or_default()
                .push(id.hash.clone());
            index_of.insert(id, index);
        }

        let mut first_error = None;
        for (root, hashes) in by_root {
            self.cancel.check()?;

            let fetched = self.fetcher.fetch(&root, &hashes, &mut |value: T| {
                if let Some(&index) = index_of.get(value.id()) {
                    on_loaded(index, value);
                }
            });

            if let Err(err) = fetched {
                if is_cancellation(&err) {
                    return Err(err);
                }
                warn!(root = %root.display(), ids = hashes.len(), error = %err, "details.fetch_failed");
                first_error.get_or_insert(err);
            }
        }

        self.cancel.check()?;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn evict_stale(&self, state: &mut State<T>) -> usize {
        let Some(horizon) = state.generation.checked_sub(self.window) else {
            return 0;
        };
        let stale: Vec<CommitIndex> = state
            .entries
            .iter()
            .filter_map(|(index, entry)| match entry {
                CacheEntry::Loading(generation) if *generation <= horizon => Some(*index),
                _ => None,
            })
            .collect();

        for index in &stale {
            state.entries.pop(index);
        }
        if !stale.is_empty() {
            debug!(evicted = stale.len(), horizon, "details.placeholders.evicted");
        }
        stale.len()
    }
}
