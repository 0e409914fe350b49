use crate::commit::{CommitId, CommitIndex, VcsUser};
use crate::config::LogConfig;
use crate::detail_cache::DetailCache;
use crate::details::{CommitDetails, CommitMetadata, FullDetailsFetcher, MetadataFetcher};
use crate::hash::Hash;
use crate::provider::{provider_for, Providers};
use crate::refresher::{LogRefresher, RefresherState};
use crate::snapshot::CommitGraphSnapshot;
use crate::storage::{index_all, open_index_store, CommitIndexStore, UserRegistry};
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub type MetadataCache = DetailCache<CommitMetadata, MetadataFetcher>;
pub type DetailsCache = DetailCache<CommitDetails, FullDetailsFetcher>;

/// Entry point for a log over one or more repository roots: keeps the commit graph
/// fresh and serves commit details.
pub struct VcsLogData {
    storage_dir: PathBuf,
    providers: Arc<Providers>,
    store: Arc<dyn CommitIndexStore>,
    users: Arc<UserRegistry>,
    refresher: LogRefresher,
    metadata: MetadataCache,
    details: DetailsCache,
}

impl VcsLogData {
    /// Wire storage, caches and the refresh engine. Nothing runs until `initialize`.
    /// Unusable storage degrades to memory; this never fails.
    pub fn open(storage_dir: &Path, providers: Providers, config: LogConfig) -> Self {
        let providers = Arc::new(providers);
        let store = open_index_store(storage_dir);
        let users = Arc::new(UserRegistry::open(storage_dir));

        let refresher = LogRefresher::new(Arc::clone(&providers), Arc::clone(&store), config.clone());
        {
            // durability at cycle boundaries
            let store = Arc::clone(&store);
            let users = Arc::clone(&users);
            refresher.subscribe(move |snapshot| {
                if snapshot.is_overlay() || snapshot.data().is_none() {
                    return;
                }
                if let Err(err) = store.flush() {
                    warn!(error = %err, "log_data.index_flush_failed");
                }
                if let Err(err) = users.flush() {
                    warn!(error = %err, "log_data.users_flush_failed");
                }
            });
        }

        let metadata = DetailCache::new(
            Arc::clone(&store),
            MetadataFetcher::new(Arc::clone(&providers), Some(Arc::clone(&users))),
            config.metadata_cache_size,
            config.placeholder_generation_window,
            config.task_queue_depth,
        );
        let details = DetailCache::new(
            Arc::clone(&store),
            FullDetailsFetcher::new(Arc::clone(&providers)),
            config.details_cache_size,
            config.placeholder_generation_window,
            config.task_queue_depth,
        );

        info!(
            storage = %storage_dir.display(),
            roots = providers.len(),
            persistent = store.is_persistent(),
            "log_data.opened"
        );

        Self {
            storage_dir: storage_dir.to_path_buf(),
            providers,
            store,
            users,
            refresher,
            metadata,
            details,
        }
    }

    /// Like `open`, with configuration read from the storage dir and home directory
    pub fn open_configured(storage_dir: &Path, providers: Providers) -> Result<Self> {
        let config = LogConfig::load(storage_dir)?;
        Ok(Self::open(storage_dir, providers, config))
    }

    pub fn initialize(&self) -> Result<()> {
        self.refresher.initialize()
    }

    pub fn refresh(&self, roots: impl IntoIterator<Item = PathBuf>, optimized: bool) {
        self.refresher.refresh(roots, optimized);
    }

    pub fn refresh_all(&self) {
        self.refresher.refresh(self.providers.keys().cloned(), false);
    }

    pub fn subscribe(&self, listener: impl Fn(&CommitGraphSnapshot) + Send + Sync + 'static) {
        self.refresher.subscribe(listener);
    }

    pub fn current_snapshot(&self) -> CommitGraphSnapshot {
        self.refresher.current_snapshot()
    }

    pub fn is_busy(&self) -> bool {
        self.refresher.is_busy()
    }

    pub fn state(&self) -> RefresherState {
        self.refresher.state()
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn details(&self) -> &DetailsCache {
        &self.details
    }

    pub fn request_details<S, E>(&self, indices: Vec<CommitIndex>, on_success: S, on_error: E)
    where
        S: FnOnce(Vec<CommitDetails>) + Send + 'static,
        E: FnOnce(anyhow::Error) + Send + 'static,
    {
        self.details.request_details(indices, on_success, on_error);
    }

    /// Blocks until loaded; keep it off latency-sensitive threads
    pub fn request_details_sync(
        &self,
        indices: &[CommitIndex],
    ) -> Result<HashMap<CommitIndex, CommitDetails>> {
        self.details.get_or_load_sync(indices)
    }

    pub fn commit_id(&self, index: CommitIndex) -> Option<CommitId> {
        self.store.id_of(index)
    }

    pub fn commit_indices(&self, root: &Path, hashes: &[Hash]) -> Vec<CommitIndex> {
        index_all(self.store.as_ref(), root, hashes)
    }

    pub fn current_branch(&self, root: &Path) -> Result<Option<String>> {
        provider_for(&self.providers, root)?.current_branch(root)
    }

    /// The user configured for `root`, registered with the user registry
    pub fn current_user(&self, root: &Path) -> Result<Option<VcsUser>> {
        let user = provider_for(&self.providers, root)?.current_user(root)?;
        if let Some(user) = &user {
            self.users.user_index(user);
        }
        Ok(user)
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.providers.keys().map(PathBuf::as_path)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    /// Stop refreshing and loading, then flush storage. The last snapshot stays readable.
    pub fn dispose(&self) {
        self.refresher.dispose();
        self.metadata.dispose();
        self.details.dispose();

        if let Err(err) = self.store.flush() {
            warn!(error = %err, "log_data.index_flush_failed");
        }
        if let Err(err) = self.users.flush() {
            warn!(error = %err, "log_data.users_flush_failed");
        }
        info!(storage = %self.storage_dir.display(), "log_data.disposed");
    }
}
