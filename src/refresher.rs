/*
Refresh engine: one worker thread turns refresh requests into published snapshots.
 - first start loads a bounded recent window of every root, then refreshes all roots
 - requests that pile up while a cycle runs are drained and folded into one
 - a complete snapshot is joined with a recent window, anything else is reloaded in full
*/

use crate::cancel::CancellationToken;
use crate::commit::{GraphCommit, TimedCommit};
use crate::config::LogConfig;
use crate::error::{is_cancellation, LogError};
use crate::join::join_single_root;
use crate::provider::{provider_for, Providers, RecentRequest};
use crate::refs::{RefsSnapshot, VcsRef};
use crate::snapshot::{CommitGraphSnapshot, GraphData, SnapshotBuilder};
use crate::storage::CommitIndexStore;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Roots to refresh. Requests fold: roots union, overlay flag OR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshRequest {
    pub roots: BTreeSet<PathBuf>,
    pub wants_overlay: bool,
}

impl RefreshRequest {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>, wants_overlay: bool) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            wants_overlay,
        }
    }

    pub fn fold(mut self, other: RefreshRequest) -> Self {
        self.roots.extend(other.roots);
        self.wants_overlay |= other.wants_overlay;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefresherState {
    Idle,
    InitialLoad,
    Accumulating,
    IncrementalJoin,
    FullReload,
    /// Last cycle published an error snapshot
    Error,
}

enum Message {
    Refresh(RefreshRequest),
    Shutdown,
}

type SnapshotListener = Arc<dyn Fn(&CommitGraphSnapshot) + Send + Sync>;

/// Commits and refs of one root as read from its provider
struct RootLoad {
    commits: Vec<GraphCommit>,
    refs: RefsSnapshot,
}

struct Shared {
    providers: Arc<Providers>,
    store: Arc<dyn CommitIndexStore>,
    config: LogConfig,
    builder: SnapshotBuilder,
    current: RwLock<CommitGraphSnapshot>,
    listeners: RwLock<Vec<SnapshotListener>>,
    state: Mutex<RefresherState>,
    busy: AtomicBool,
    cycles: AtomicU64,
    cancel: CancellationToken,
}

pub struct LogRefresher {
    shared: Arc<Shared>,
    tx: Sender<Message>,
    rx: Mutex<Option<Receiver<Message>>>,
    done: Mutex<Option<Receiver<()>>>,
    disposed: AtomicBool,
}

impl LogRefresher {
    pub fn new(
        providers: Arc<Providers>,
        store: Arc<dyn CommitIndexStore>,
        config: LogConfig,
    ) -> Self {
        let (tx, rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                builder: SnapshotBuilder::new(Arc::clone(&providers)),
                providers,
                store,
                config,
                current: RwLock::new(CommitGraphSnapshot::Empty),
                listeners: RwLock::new(Vec::new()),
                state: Mutex::new(RefresherState::Idle),
                busy: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            done: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start the worker and the initial load. Calling again does nothing.
    pub fn initialize(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(LogError::Disposed.into());
        }
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };

        let (done_tx, done_rx) = bounded::<()>(1);
        *self.done.lock() = Some(done_rx);
        self.shared.busy.store(true, Ordering::SeqCst);

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            rx,
            authoritative: CommitGraphSnapshot::Empty,
        };
        thread::Builder::new()
            .name("vcs-log-refresher".to_string())
            .spawn(move || {
                worker.run();
                drop(done_tx);
            })
            .context("Failed to spawn refresh worker")?;
        Ok(())
    }

    /// Queue a refresh of `roots`; `optimized` asks for a quick overlay preview first.
    /// Never blocks.
    pub fn refresh(&self, roots: impl IntoIterator<Item = PathBuf>, optimized: bool) {
        self.request(RefreshRequest::new(roots, optimized));
    }

    pub fn request(&self, request: RefreshRequest) {
        if self.disposed.load(Ordering::Acquire) {
            debug!("refresher.request_after_dispose");
            return;
        }
        self.shared.busy.store(true, Ordering::SeqCst);
        if self.tx.send(Message::Refresh(request)).is_err() {
            debug!("refresher.worker_gone");
        }
    }

    /// Called on the worker thread for every published snapshot, overlays included
    pub fn subscribe(&self, listener: impl Fn(&CommitGraphSnapshot) + Send + Sync + 'static) {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    pub fn current_snapshot(&self) -> CommitGraphSnapshot {
        self.shared.current.read().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RefresherState {
        *self.shared.state.lock()
    }

    /// Refresh cycles acted upon; a coalesced burst counts once
    pub fn processed_cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    /// Cancel the running cycle and stop the worker, waiting at most the configured timeout.
    /// The last published snapshot stays readable.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        let _ = self.tx.send(Message::Shutdown);
        self.shared.listeners.write().clear();

        if let Some(done) = self.done.lock().take() {
            let timeout = self.shared.config.dispose_timeout;
            match done.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "refresher.dispose.timeout"
                    );
                }
                _ => debug!("refresher.dispose.complete"),
            }
        }

        self.shared.busy.store(false, Ordering::SeqCst);
        self.shared.set_state(RefresherState::Idle);
    }
}

impl Drop for LogRefresher {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Shared {
    fn set_state(&self, state: RefresherState) {
        *self.state.lock() = state;
    }

    fn publish(&self, snapshot: CommitGraphSnapshot) {
        if self.cancel.is_cancelled() {
            return;
        }
        *self.current.write() = snapshot.clone();

        let listeners: Vec<SnapshotListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn to_graph_commit(&self, root: &Path, commit: &TimedCommit) -> GraphCommit {
        let parents = commit
            .parents
            .iter()
            .map(|parent| self.store.index_of(parent, root))
            .collect();
        GraphCommit::new(self.store.index_of(&commit.hash, root), parents, commit.timestamp)
    }

    fn resolve_refs(&self, root: &Path, refs: Vec<VcsRef>) -> Result<RefsSnapshot> {
        let resolved = refs.into_iter().map(|vcs_ref| {
            self.store.ref_index_of(&vcs_ref);
            (self.store.index_of(&vcs_ref.hash, root), vcs_ref)
        });
        Ok(RefsSnapshot::new(root, resolved)?)
    }

    fn load_recent(&self, root: &Path, count: usize) -> Result<RootLoad> {
        let provider = provider_for(&self.providers, root)?;
        let block = provider
            .read_recent(root, &RecentRequest::new(count), &self.cancel)
            .with_context(|| format!("Failed to read recent commits of {}", root.display()))?;
        self.cancel.check()?;

        let commits = block
            .commits
            .iter()
            .map(|commit| self.to_graph_commit(root, commit))
            .collect();
        let refs = self.resolve_refs(root, block.refs)?;
        Ok(RootLoad { commits, refs })
    }

    fn load_full(&self, root: &Path) -> Result<RootLoad> {
        let provider = provider_for(&self.providers, root)?;
        let mut commits = Vec::new();
        let refs = provider
            .read_full_history(root, &self.cancel, &mut |commit| {
                commits.push(self.to_graph_commit(root, &commit));
            })
            .with_context(|| format!("Failed to read history of {}", root.display()))?;
        self.cancel.check()?;

        let refs = self.resolve_refs(root, refs)?;
        Ok(RootLoad { commits, refs })
    }

    /// Load every root in parallel. Failing roots are logged and left out; the
    /// call fails only when every root failed or on cancellation.
    fn load_roots(
        &self,
        roots: &[PathBuf],
        load: impl Fn(&Shared, &Path) -> Result<RootLoad> + Sync,
    ) -> Result<BTreeMap<PathBuf, RootLoad>> {
        let results: Vec<(PathBuf, Result<RootLoad>)> = roots
            .par_iter()
            .map(|root| (root.clone(), load(self, root)))
            .collect();

        let mut loaded = BTreeMap::new();
        let mut first_error = None;
        for (root, result) in results {
            match result {
                Ok(root_load) => {
                    loaded.insert(root, root_load);
                }
                Err(err) if is_cancellation(&err) => return Err(err),
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "refresher.root_failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        self.cancel.check()?;

        match first_error {
            Some(err) if loaded.is_empty() => Err(err),
            _ => Ok(loaded),
        }
    }

    fn all_roots(&self) -> Vec<PathBuf> {
        self.providers.keys().cloned().collect()
    }
}

struct Worker {
    shared: Arc<Shared>,
    rx: Receiver<Message>,
    /// Last non-overlay snapshot; joins start from here
    authoritative: CommitGraphSnapshot,
}

impl Worker {
    fn run(mut self) {
        info!(roots = self.shared.providers.len(), "refresher.started");

        let mut carry = match self.initial_load() {
            Ok(snapshot) => {
                self.publish_authoritative(snapshot);
                Some(RefreshRequest::new(self.shared.all_roots(), false))
            }
            Err(err) if is_cancellation(&err) => {
                self.stop();
                return;
            }
            Err(err) => {
                error!(error = %err, "refresher.initial_load.failed");
                self.shared.set_state(RefresherState::Error);
                self.shared.publish(CommitGraphSnapshot::error(err));
                None
            }
        };

        loop {
            let mut request = match carry.take() {
                Some(request) => request,
                None => {
                    if self.rx.is_empty() {
                        let mut state = self.shared.state.lock();
                        if *state != RefresherState::Error {
                            *state = RefresherState::Idle;
                        }
                        self.shared.busy.store(false, Ordering::SeqCst);
                    }
                    match self.rx.recv() {
                        Ok(Message::Refresh(request)) => request,
                        Ok(Message::Shutdown) | Err(_) => break,
                    }
                }
            };
            self.shared.busy.store(true, Ordering::SeqCst);
            self.shared.set_state(RefresherState::Accumulating);

            let mut shutdown = false;
            for message in self.rx.try_iter() {
                match message {
                    Message::Refresh(next) => request = request.fold(next),
                    Message::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
            }
            if shutdown || self.shared.cancel.is_cancelled() {
                break;
            }

            let unknown: Vec<PathBuf> = request
                .roots
                .iter()
                .filter(|root| !self.shared.providers.contains_key(*root))
                .cloned()
                .collect();
            for root in &unknown {
                warn!(root = %root.display(), "refresher.unknown_root");
                request.roots.remove(root);
            }
            if request.is_empty() {
                continue;
            }

            let cycle = self.shared.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                cycle,
                roots = request.roots.len(),
                overlay = request.wants_overlay,
                "refresher.cycle.start"
            );

            match self.process(&request) {
                Ok(snapshot) => {
                    debug!(cycle, commits = snapshot.commit_count(), "refresher.cycle.complete");
                    self.publish_authoritative(snapshot);
                }
                Err(err) if is_cancellation(&err) => {
                    debug!(cycle, "refresher.cycle.cancelled");
                    break;
                }
                Err(err) => {
                    error!(cycle, error = %err, "refresher.cycle.failed");
                    self.shared.set_state(RefresherState::Error);
                    self.shared.publish(CommitGraphSnapshot::error(err));
                }
            }
        }

        self.stop();
    }

    fn stop(&self) {
        self.shared.set_state(RefresherState::Idle);
        self.shared.busy.store(false, Ordering::SeqCst);
        info!(cycles = self.shared.cycles.load(Ordering::SeqCst), "refresher.stopped");
    }

    fn publish_authoritative(&mut self, snapshot: CommitGraphSnapshot) {
        self.authoritative = snapshot.clone();
        self.shared.publish(snapshot);
    }

    fn initial_load(&self) -> Result<CommitGraphSnapshot> {
        self.shared.set_state(RefresherState::InitialLoad);
        let count = self.shared.config.recent_commit_count;
        let loaded = self
            .shared
            .load_roots(&self.shared.all_roots(), |shared, root| shared.load_recent(root, count))?;

        info!(roots = loaded.len(), window = count, "refresher.initial_load.complete");
        Ok(self.build(loaded, false))
    }

    fn process(&self, request: &RefreshRequest) -> Result<CommitGraphSnapshot> {
        if request.wants_overlay && self.shared.config.overlay_enabled {
            self.publish_overlay(request)?;
        }
        self.shared.cancel.check()?;

        match self.authoritative.data() {
            Some(data) if data.complete => self.incremental(request, data),
            _ => self.full_reload(),
        }
    }

    fn incremental(&self, request: &RefreshRequest, data: &GraphData) -> Result<CommitGraphSnapshot> {
        let roots: Vec<PathBuf> = request.roots.iter().cloned().collect();
        let config = &self.shared.config;
        let mut window = config.recent_commit_count;

        for attempt in 1..=config.join_attempts {
            self.shared.set_state(RefresherState::IncrementalJoin);
            let loaded = self
                .shared
                .load_roots(&roots, |shared, root| shared.load_recent(root, window))?;
            self.shared.cancel.check()?;

            if let Some(snapshot) = self.join(data, loaded) {
                debug!(attempt, window, "refresher.join.complete");
                return Ok(snapshot);
            }
            info!(attempt, window, "refresher.join.failed");
            window = window.saturating_mul(config.join_window_multiplier);
        }

        info!(attempts = config.join_attempts, "refresher.join.fallback_full_reload");
        self.full_reload()
    }

    /// Join each loaded root with its known commits. Roots that failed to load keep their
    /// previous data. None when any root's window does not connect.
    fn join(&self, data: &GraphData, loaded: BTreeMap<PathBuf, RootLoad>) -> Option<CommitGraphSnapshot> {
        let mut per_root = data.per_root.clone();
        let mut refs: BTreeMap<PathBuf, RefsSnapshot> = data
            .refs
            .snapshots()
            .map(|snapshot| (snapshot.root().to_path_buf(), snapshot.clone()))
            .collect();

        for (root, root_load) in loaded {
            let old_refs = data
                .refs_of(&root)
                .map(RefsSnapshot::ref_commits)
                .unwrap_or_default();
            let new_refs = root_load.refs.ref_commits();

            let joined = join_single_root(
                data.commits_of(&root),
                &root_load.commits,
                &old_refs,
                &new_refs,
            )?;
            per_root.insert(root.clone(), Arc::new(joined));
            refs.insert(root, root_load.refs);
        }

        Some(self.shared.builder.build(per_root, refs.into_values(), true))
    }

    fn full_reload(&self) -> Result<CommitGraphSnapshot> {
        self.shared.set_state(RefresherState::FullReload);
        let loaded = self
            .shared
            .load_roots(&self.shared.all_roots(), |shared, root| shared.load_full(root))?;

        info!(
            roots = loaded.len(),
            commits = loaded.values().map(|l| l.commits.len()).sum::<usize>(),
            "refresher.full_reload.complete"
        );
        Ok(self.build(loaded, true))
    }

    /// Quick preview of the requested roots; other roots show a truncated view of known data
    fn publish_overlay(&self, request: &RefreshRequest) -> Result<()> {
        let count = self.shared.config.overlay_commit_count;
        let roots: Vec<PathBuf> = request.roots.iter().cloned().collect();
        let loaded = match self
            .shared
            .load_roots(&roots, |shared, root| shared.load_recent(root, count))
        {
            Ok(loaded) => loaded,
            Err(err) if is_cancellation(&err) => return Err(err),
            Err(err) => {
                debug!(error = %err, "refresher.overlay.skipped");
                return Ok(());
            }
        };

        let mut per_root = BTreeMap::new();
        let mut refs = Vec::new();
        if let Some(data) = self.authoritative.data() {
            for (root, commits) in &data.per_root {
                if loaded.contains_key(root) {
                    continue;
                }
                per_root.insert(root.clone(), Arc::new(commits.iter().take(count).cloned().collect()));
                refs.extend(data.refs_of(root).cloned());
            }
        }
        for (root, root_load) in loaded {
            per_root.insert(root, Arc::new(root_load.commits));
            refs.push(root_load.refs);
        }

        let overlay = self.shared.builder.build_overlay(per_root, refs);
        debug!(commits = overlay.commit_count(), "refresher.overlay.published");
        self.shared.publish(overlay);
        Ok(())
    }

    fn build(&self, loaded: BTreeMap<PathBuf, RootLoad>, complete: bool) -> CommitGraphSnapshot {
        let mut per_root = BTreeMap::new();
        let mut refs = Vec::with_capacity(loaded.len());
        for (root, root_load) in loaded {
            per_root.insert(root, Arc::new(root_load.commits));
            refs.push(root_load.refs);
        }
        self.shared.builder.build(per_root, refs, complete)
    }
}
