use anyhow::Result;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vcs_log::{
    CancellationToken, Change, ChangeKind, CommitDetails, CommitGraphSnapshot, CommitId,
    CommitMetadata, Hash, LogConfig, LogProvider, Providers, RecentBlock, RecentRequest, RefKind,
    TimedCommit, VcsLogData, VcsRef, VcsUser,
};

/// Repository that grows by a few commits every tick
struct SyntheticRepo {
    root: PathBuf,
    commits: Mutex<Vec<TimedCommit>>,
}

impl SyntheticRepo {
    fn new(root: &str, initial: u32) -> Arc<Self> {
        let repo = Arc::new(Self {
            root: PathBuf::from(root),
            commits: Mutex::new(Vec::new()),
        });
        repo.grow(initial);
        repo
    }

    fn commit_hash(&self, n: u32) -> Hash {
        let digest = Sha256::digest(format!("{}:{}", self.root.display(), n).as_bytes());
        Hash::from_bytes(&digest[..20])
    }

    fn grow(&self, count: u32) {
        let mut commits = self.commits.lock();
        let start = commits.len() as u32;
        for n in start..start + count {
            let mut parents = Vec::new();
            if n > 0 {
                parents.push(self.commit_hash(n - 1));
            }
            // a merge every tenth commit
            if n >= 10 && n % 10 == 0 {
                parents.push(self.commit_hash(n - 7));
            }
            let commit = TimedCommit::new(self.commit_hash(n), parents, 1_700_000_000 + n as i64 * 90);
            commits.insert(0, commit);
        }
    }

    fn head_ref(&self) -> Vec<VcsRef> {
        let commits = self.commits.lock();
        commits
            .first()
            .map(|head| vec![VcsRef::new(head.hash.clone(), "main", RefKind::LocalBranch, &self.root)])
            .unwrap_or_default()
    }

    fn metadata(&self, commit: &TimedCommit) -> CommitMetadata {
        CommitMetadata::new(
            CommitId::new(commit.hash.clone(), &self.root),
            commit.parents.clone(),
            VcsUser::new("Demo Author", "demo@example.com"),
            commit.timestamp,
            format!("Synthetic change {}", commit.hash.short()),
        )
    }
}

impl LogProvider for SyntheticRepo {
    fn read_recent(
        &self,
        _root: &Path,
        request: &RecentRequest,
        cancel: &CancellationToken,
    ) -> Result<RecentBlock> {
        cancel.check()?;
        let commits = self
            .commits
            .lock()
            .iter()
            .take(request.commit_count)
            .cloned()
            .collect();
        Ok(RecentBlock {
            commits,
            refs: self.head_ref(),
        })
    }

    fn read_full_history(
        &self,
        _root: &Path,
        cancel: &CancellationToken,
        on_commit: &mut dyn FnMut(TimedCommit),
    ) -> Result<Vec<VcsRef>> {
        let commits = self.commits.lock().clone();
        for commit in commits {
            cancel.check()?;
            on_commit(commit);
        }
        Ok(self.head_ref())
    }

    fn read_metadata(
        &self,
        _root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitMetadata),
    ) -> Result<()> {
        let commits = self.commits.lock().clone();
        for commit in commits.iter().filter(|c| hashes.contains(&c.hash)) {
            on_each(self.metadata(commit));
        }
        Ok(())
    }

    fn read_full_details(
        &self,
        _root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitDetails),
    ) -> Result<()> {
        let commits = self.commits.lock().clone();
        for commit in commits.iter().filter(|c| hashes.contains(&c.hash)) {
            let changes = vec![Change::new(
                format!("src/{}.rs", commit.hash.short()),
                ChangeKind::Modified,
            )];
            on_each(CommitDetails::new(self.metadata(commit), changes));
        }
        Ok(())
    }

    fn current_branch(&self, _root: &Path) -> Result<Option<String>> {
        Ok(Some("main".to_string()))
    }

    fn current_user(&self, _root: &Path) -> Result<Option<VcsUser>> {
        Ok(Some(VcsUser::new("Demo Author", "demo@example.com")))
    }
}

fn describe(snapshot: &CommitGraphSnapshot) -> String {
    match snapshot {
        CommitGraphSnapshot::Empty => "empty".to_string(),
        CommitGraphSnapshot::Error(err) => format!("error: {err:#}"),
        CommitGraphSnapshot::Ready(data) => format!(
            "{} commits, {} heads, {} refs{}{}",
            data.graph.len(),
            data.graph.heads().len(),
            data.refs.len(),
            if data.complete { ", complete" } else { "" },
            if data.overlay { ", overlay" } else { "" },
        ),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let storage_dir = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        std::env::temp_dir().join("vcs-log-demo")
    };

    let repos = [SyntheticRepo::new("/demo/app", 400), SyntheticRepo::new("/demo/lib", 150)];
    let providers: Providers = repos
        .iter()
        .map(|repo| {
            let provider: Arc<dyn LogProvider> = repo.clone();
            (repo.root.clone(), provider)
        })
        .collect();

    let config = LogConfig {
        recent_commit_count: 50,
        ..LogConfig::load(&storage_dir)?
    };
    println!("Storage: {}", storage_dir.display());

    let log = VcsLogData::open(&storage_dir, providers, config);
    log.subscribe(|snapshot| println!("  published: {}", describe(snapshot)));
    log.initialize()?;

    for tick in 1..=5 {
        thread::sleep(Duration::from_millis(300));
        let repo = &repos[tick % repos.len()];
        repo.grow(if tick == 4 { 400 } else { 3 });
        println!("\n[tick {}] {} grew, refreshing", tick, repo.root.display());
        log.refresh([repo.root.clone()], tick % 2 == 0);
    }

    while log.is_busy() {
        thread::sleep(Duration::from_millis(50));
    }

    let snapshot = log.current_snapshot();
    println!("\nFinal: {}", describe(&snapshot));
    if let Some(data) = snapshot.data() {
        let rows: Vec<u32> = data.graph.commits().iter().take(5).map(|c| c.id).collect();
        for (index, metadata) in log.metadata().get_or_load_sync(&rows)? {
            println!("  #{:<6} {} ({})", index, metadata.subject, metadata.author);
        }
    }

    log.dispose();
    Ok(())
}
