#![allow(dead_code)]

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vcs_log::{
    CancellationToken, Change, ChangeKind, CommitDetails, CommitId, CommitMetadata, Hash,
    LogError, LogProvider, Providers, RecentBlock, RecentRequest, RefKind, TimedCommit, VcsRef,
    VcsUser,
};

pub const BASE_TIME: i64 = 1_700_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic 20-byte hash for commit number `n`
pub fn hash(n: u32) -> Hash {
    let mut bytes = [0xab_u8; 20];
    bytes[..4].copy_from_slice(&n.to_be_bytes());
    Hash::from_bytes(&bytes)
}

pub fn test_user() -> VcsUser {
    VcsUser::new("Test User", "test@test.com")
}

/// Poll `condition` until it holds; panics after `timeout`
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("condition not reached within {:?}", timeout);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

struct History {
    /// Newest first
    commits: Vec<TimedCommit>,
    refs: Vec<VcsRef>,
}

/// In-memory repository standing in for a real VCS backend
pub struct FakeProvider {
    root: PathBuf,
    history: Mutex<History>,
    blocked: AtomicBool,
    waiting: AtomicBool,
    failing: AtomicBool,
    recent_windows: Mutex<Vec<usize>>,
    full_reloads: AtomicUsize,
    metadata_calls: AtomicUsize,
    details_calls: AtomicUsize,
}

impl FakeProvider {
    /// Linear history of `count` commits (commit 0 is the root commit), `main` at the tip
    pub fn linear(root: impl Into<PathBuf>, count: u32) -> Arc<Self> {
        let provider = Arc::new(Self {
            root: root.into(),
            history: Mutex::new(History {
                commits: Vec::new(),
                refs: Vec::new(),
            }),
            blocked: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            recent_windows: Mutex::new(Vec::new()),
            full_reloads: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            details_calls: AtomicUsize::new(0),
        });
        provider.extend_linear(0, count);
        provider
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add commits `from..to` on top of the current tip and move `main`
    pub fn extend_linear(&self, from: u32, to: u32) {
        let mut history = self.history.lock();
        for n in from..to {
            let parents = if n == 0 { vec![] } else { vec![hash(n - 1)] };
            history
                .commits
                .insert(0, TimedCommit::new(hash(n), parents, BASE_TIME + n as i64 * 60));
        }
        if to > 0 {
            history.refs.retain(|r| r.name != "main");
            history
                .refs
                .push(VcsRef::new(hash(to - 1), "main", RefKind::LocalBranch, &self.root));
        }
    }

    pub fn add_commit(&self, n: u32, parents: &[u32], timestamp: i64) {
        let parents = parents.iter().map(|&p| hash(p)).collect();
        self.history
            .lock()
            .commits
            .insert(0, TimedCommit::new(hash(n), parents, timestamp));
    }

    pub fn set_ref(&self, name: &str, kind: RefKind, target: u32) {
        let mut history = self.history.lock();
        history.refs.retain(|r| r.name != name);
        history
            .refs
            .push(VcsRef::new(hash(target), name, kind, &self.root));
    }

    pub fn remove_ref(&self, name: &str) {
        self.history.lock().refs.retain(|r| r.name != name);
    }

    /// Forget an unreachable commit, as garbage collection would
    pub fn remove_commit(&self, n: u32) {
        let target = hash(n);
        self.history.lock().commits.retain(|c| c.hash != target);
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// A history read is parked on the block
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn recent_windows(&self) -> Vec<usize> {
        self.recent_windows.lock().clone()
    }

    pub fn full_reloads(&self) -> usize {
        self.full_reloads.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn details_calls(&self) -> usize {
        self.details_calls.load(Ordering::SeqCst)
    }

    fn wait_while_blocked(&self, cancel: &CancellationToken) -> Result<()> {
        while self.blocked.load(Ordering::SeqCst) {
            self.waiting.store(true, Ordering::SeqCst);
            if cancel.is_cancelled() {
                self.waiting.store(false, Ordering::SeqCst);
                return Err(LogError::Cancelled.into());
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.waiting.store(false, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("backend unavailable for {}", self.root.display());
        }
        Ok(())
    }

    fn find(&self, hash: &Hash) -> Option<TimedCommit> {
        self.history
            .lock()
            .commits
            .iter()
            .find(|c| &c.hash == hash)
            .cloned()
    }

    fn metadata_for(&self, root: &Path, commit: &TimedCommit) -> CommitMetadata {
        CommitMetadata::new(
            CommitId::new(commit.hash.clone(), root),
            commit.parents.clone(),
            test_user(),
            commit.timestamp,
            format!("Commit {}\n\nBody of {}", commit.hash.short(), commit.hash),
        )
    }
}

impl LogProvider for FakeProvider {
    fn read_recent(
        &self,
        _root: &Path,
        request: &RecentRequest,
        cancel: &CancellationToken,
    ) -> Result<RecentBlock> {
        self.recent_windows.lock().push(request.commit_count);
        self.wait_while_blocked(cancel)?;

        let history = self.history.lock();
        Ok(RecentBlock {
            commits: history
                .commits
                .iter()
                .take(request.commit_count)
                .cloned()
                .collect(),
            refs: history.refs.clone(),
        })
    }

    fn read_full_history(
        &self,
        _root: &Path,
        cancel: &CancellationToken,
        on_commit: &mut dyn FnMut(TimedCommit),
    ) -> Result<Vec<VcsRef>> {
        self.full_reloads.fetch_add(1, Ordering::SeqCst);
        self.wait_while_blocked(cancel)?;

        let (commits, refs) = {
            let history = self.history.lock();
            (history.commits.clone(), history.refs.clone())
        };
        for commit in commits {
            on_commit(commit);
        }
        Ok(refs)
    }

    fn read_metadata(
        &self,
        root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitMetadata),
    ) -> Result<()> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("backend unavailable for {}", root.display());
        }
        for hash in hashes {
            if let Some(commit) = self.find(hash) {
                on_each(self.metadata_for(root, &commit));
            }
        }
        Ok(())
    }

    fn read_full_details(
        &self,
        root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitDetails),
    ) -> Result<()> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("backend unavailable for {}", root.display());
        }
        for hash in hashes {
            if let Some(commit) = self.find(hash) {
                let changes = vec![Change::new(
                    format!("src/file_{}.rs", hash.short()),
                    ChangeKind::Added,
                )];
                on_each(CommitDetails::new(self.metadata_for(root, &commit), changes));
            }
        }
        Ok(())
    }

    fn current_branch(&self, _root: &Path) -> Result<Option<String>> {
        Ok(Some("main".to_string()))
    }

    fn current_user(&self, _root: &Path) -> Result<Option<VcsUser>> {
        Ok(Some(test_user()))
    }
}

pub fn providers(fakes: &[Arc<FakeProvider>]) -> Providers {
    fakes
        .iter()
        .map(|fake| {
            let provider: Arc<dyn LogProvider> = fake.clone();
            (fake.root().to_path_buf(), provider)
        })
        .collect()
}
