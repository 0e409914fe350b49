use crate::cancel::CancellationToken;
use crate::commit::{TimedCommit, VcsUser};
use crate::details::{CommitDetails, CommitMetadata};
use crate::error::LogError;
use crate::hash::Hash;
use crate::refs::VcsRef;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrdering {
    /// Children before parents, ties broken by date
    Topological,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentRequest {
    pub commit_count: usize,
    /// Also report the current refs of the root
    pub refresh_refs: bool,
    pub ordering: CommitOrdering,
}

impl RecentRequest {
    pub fn new(commit_count: usize) -> Self {
        Self {
            commit_count,
            refresh_refs: true,
            ordering: CommitOrdering::Topological,
        }
    }
}

/// Window of recent commits, newest first and topologically ordered
#[derive(Debug, Clone, Default)]
pub struct RecentBlock {
    pub commits: Vec<TimedCommit>,
    pub refs: Vec<VcsRef>,
}

/// Backend access for one VCS. Implementations talk to the actual VCS; this crate only consumes them.
pub trait LogProvider: Send + Sync {
    fn read_recent(
        &self,
        root: &Path,
        request: &RecentRequest,
        cancel: &CancellationToken,
    ) -> Result<RecentBlock>;

    /// Stream the whole history (children before parents) and return the current refs
    fn read_full_history(
        &self,
        root: &Path,
        cancel: &CancellationToken,
        on_commit: &mut dyn FnMut(TimedCommit),
    ) -> Result<Vec<VcsRef>>;

    fn read_metadata(
        &self,
        root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitMetadata),
    ) -> Result<()>;

    fn read_full_details(
        &self,
        root: &Path,
        hashes: &[Hash],
        on_each: &mut dyn FnMut(CommitDetails),
    ) -> Result<()>;

    fn current_branch(&self, root: &Path) -> Result<Option<String>>;

    fn current_user(&self, root: &Path) -> Result<Option<VcsUser>>;
}

/// Provider bound to each root
pub type Providers = BTreeMap<PathBuf, Arc<dyn LogProvider>>;

pub fn provider_for<'a>(providers: &'a Providers, root: &Path) -> Result<&'a Arc<dyn LogProvider>> {
    providers
        .get(root)
        .ok_or_else(|| LogError::UnknownRoot(root.to_path_buf()).into())
}
