use crate::commit::{CommitId, VcsUser};
use crate::detail_cache::DetailFetcher;
use crate::hash::Hash;
use crate::provider::{provider_for, Providers};
use crate::storage::UserRegistry;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A value served by a detail cache. `loading` builds the placeholder returned
/// while the real object is being fetched.
pub trait Detail: Clone + Send + Sync + 'static {
    fn id(&self) -> &CommitId;

    fn loading(id: CommitId) -> Self;

    fn is_loading(&self) -> bool;
}

/// Lightweight commit data shown in the log table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetadata {
    pub id: CommitId,
    pub parents: Vec<Hash>,
    pub author: VcsUser,
    pub committer: VcsUser,
    pub author_time: i64,
    pub commit_time: i64,
    pub subject: String,
    pub full_message: String,
    placeholder: bool,
}

impl CommitMetadata {
    pub fn new(
        id: CommitId,
        parents: Vec<Hash>,
        author: VcsUser,
        author_time: i64,
        full_message: impl Into<String>,
    ) -> Self {
        let full_message = full_message.into();
        Self {
            id,
            parents,
            committer: author.clone(),
            author,
            author_time,
            commit_time: author_time,
            subject: full_message.lines().next().unwrap_or("").to_string(),
            full_message,
            placeholder: false,
        }
    }

    pub fn with_committer(mut self, committer: VcsUser, commit_time: i64) -> Self {
        self.committer = committer;
        self.commit_time = commit_time;
        self
    }
}

impl Detail for CommitMetadata {
    fn id(&self) -> &CommitId {
        &self.id
    }

    fn loading(id: CommitId) -> Self {
        Self {
            id,
            parents: Vec::new(),
            author: VcsUser::new("", ""),
            committer: VcsUser::new("", ""),
            author_time: 0,
            commit_time: 0,
            subject: "Loading...".to_string(),
            full_message: String::new(),
            placeholder: true,
        }
    }

    fn is_loading(&self) -> bool {
        self.placeholder
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed { from: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Metadata plus the full change list of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDetails {
    pub metadata: CommitMetadata,
    pub changes: Vec<Change>,
}

impl CommitDetails {
    pub fn new(metadata: CommitMetadata, changes: Vec<Change>) -> Self {
        Self { metadata, changes }
    }

    /// Changed paths (the new path for renames)
    pub fn affected_paths(&self) -> impl Iterator<Item = &Path> {
        self.changes.iter().map(|c| c.path.as_path())
    }
}

impl Detail for CommitDetails {
    fn id(&self) -> &CommitId {
        &self.metadata.id
    }

    fn loading(id: CommitId) -> Self {
        Self {
            metadata: CommitMetadata::loading(id),
            changes: Vec::new(),
        }
    }

    fn is_loading(&self) -> bool {
        self.metadata.is_loading()
    }
}

/// Metadata through the provider of each root; authors and committers land in the user registry
pub struct MetadataFetcher {
    providers: Arc<Providers>,
    users: Option<Arc<UserRegistry>>,
}

impl MetadataFetcher {
    pub fn new(providers: Arc<Providers>, users: Option<Arc<UserRegistry>>) -> Self {
        Self { providers, users }
    }
}

impl DetailFetcher<CommitMetadata> for MetadataFetcher {
    fn fetch(
        &self,
        root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitMetadata),
    ) -> Result<()> {
        let provider = provider_for(&self.providers, root)?;
        provider.read_metadata(root, hashes, &mut |metadata| {
            if let Some(users) = &self.users {
                users.user_index(&metadata.author);
                users.user_index(&metadata.committer);
            }
            on_each(metadata);
        })
    }
}

pub struct FullDetailsFetcher {
    providers: Arc<Providers>,
}

impl FullDetailsFetcher {
    pub fn new(providers: Arc<Providers>) -> Self {
        Self { providers }
    }
}

impl DetailFetcher<CommitDetails> for FullDetailsFetcher {
    fn fetch(
        &self,
        root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitDetails),
    ) -> Result<()> {
        let provider = provider_for(&self.providers, root)?;
        provider.read_full_details(root, hashes, on_each)
    }
}
