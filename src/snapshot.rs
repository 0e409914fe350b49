use crate::commit::{CommitIndex, GraphCommit};
use crate::join::{heads, join_multi_root};
use crate::provider::Providers;
use crate::refs::{RefsModel, RefsSnapshot};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Combined commit list of all roots, newest first, children before parents within a root
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    commits: Vec<GraphCommit>,
    heads: HashSet<CommitIndex>,
    positions: HashMap<CommitIndex, usize>,
}

impl CommitGraph {
    fn new(commits: Vec<GraphCommit>, heads: HashSet<CommitIndex>) -> Self {
        let positions = commits
            .iter()
            .enumerate()
            .map(|(pos, c)| (c.id, pos))
            .collect();
        Self {
            commits,
            heads,
            positions,
        }
    }

    pub fn commits(&self) -> &[GraphCommit] {
        &self.commits
    }

    /// Commits no other loaded commit points at
    pub fn heads(&self) -> &HashSet<CommitIndex> {
        &self.heads
    }

    pub fn get(&self, index: CommitIndex) -> Option<&GraphCommit> {
        self.positions.get(&index).map(|&pos| &self.commits[pos])
    }

    /// Row of `index` in the combined order
    pub fn position_of(&self, index: CommitIndex) -> Option<usize> {
        self.positions.get(&index).copied()
    }

    pub fn contains(&self, index: CommitIndex) -> bool {
        self.positions.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

impl PartialEq for CommitGraph {
    fn eq(&self, other: &Self) -> bool {
        self.commits == other.commits && self.heads == other.heads
    }
}

/// Everything a loaded snapshot carries
pub struct GraphData {
    pub graph: CommitGraph,
    pub refs: RefsModel,
    /// Per-root commit lists the combined graph was built from; the next join starts here
    pub per_root: BTreeMap<PathBuf, Arc<Vec<GraphCommit>>>,
    pub providers: Arc<Providers>,
    /// Whole history of every root is loaded
    pub complete: bool,
    /// Throwaway preview, never joined against
    pub overlay: bool,
}

impl GraphData {
    pub fn commits_of(&self, root: &Path) -> &[GraphCommit] {
        self.per_root
            .get(root)
            .map(|commits| commits.as_slice())
            .unwrap_or(&[])
    }

    pub fn refs_of(&self, root: &Path) -> Option<&RefsSnapshot> {
        self.refs.for_root(root)
    }
}

impl fmt::Debug for GraphData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphData")
            .field("commits", &self.graph.len())
            .field("refs", &self.refs.len())
            .field("roots", &self.per_root.keys().collect::<Vec<_>>())
            .field("complete", &self.complete)
            .field("overlay", &self.overlay)
            .finish()
    }
}

/// Immutable published view of the log. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub enum CommitGraphSnapshot {
    #[default]
    Empty,
    Error(Arc<anyhow::Error>),
    Ready(Arc<GraphData>),
}

impl CommitGraphSnapshot {
    pub fn error(err: anyhow::Error) -> Self {
        Self::Error(Arc::new(err))
    }

    pub fn data(&self) -> Option<&GraphData> {
        match self {
            Self::Ready(data) => Some(data.as_ref()),
            _ => None,
        }
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Error(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_complete(&self) -> bool {
        self.data().is_some_and(|data| data.complete)
    }

    pub fn is_overlay(&self) -> bool {
        self.data().is_some_and(|data| data.overlay)
    }

    pub fn commit_count(&self) -> usize {
        self.data().map_or(0, |data| data.graph.len())
    }

    /// Same commits, refs, roots and completeness; identity is ignored
    pub fn content_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => true,
            (Self::Ready(a), Self::Ready(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.complete == b.complete
                        && a.overlay == b.overlay
                        && a.graph == b.graph
                        && a.refs == b.refs
                        && a.providers.keys().eq(b.providers.keys()))
            }
            _ => false,
        }
    }
}

/// Assembles snapshots from per-root commit lists and refs
pub struct SnapshotBuilder {
    providers: Arc<Providers>,
}

impl SnapshotBuilder {
    pub fn new(providers: Arc<Providers>) -> Self {
        Self { providers }
    }

    pub fn build(
        &self,
        per_root: BTreeMap<PathBuf, Arc<Vec<GraphCommit>>>,
        refs: impl IntoIterator<Item = RefsSnapshot>,
        complete: bool,
    ) -> CommitGraphSnapshot {
        self.assemble(per_root, refs, complete, false)
    }

    /// Partial preview from a small recent window; never complete
    pub fn build_overlay(
        &self,
        per_root: BTreeMap<PathBuf, Arc<Vec<GraphCommit>>>,
        refs: impl IntoIterator<Item = RefsSnapshot>,
    ) -> CommitGraphSnapshot {
        self.assemble(per_root, refs, false, true)
    }

    fn assemble(
        &self,
        per_root: BTreeMap<PathBuf, Arc<Vec<GraphCommit>>>,
        refs: impl IntoIterator<Item = RefsSnapshot>,
        complete: bool,
        overlay: bool,
    ) -> CommitGraphSnapshot {
        let lists: Vec<Vec<GraphCommit>> = per_root
            .values()
            .map(|commits| commits.as_ref().clone())
            .collect();
        let head_set: HashSet<CommitIndex> = lists.iter().flat_map(|list| heads(list)).collect();
        let graph = CommitGraph::new(join_multi_root(&lists), head_set);

        CommitGraphSnapshot::Ready(Arc::new(GraphData {
            graph,
            refs: RefsModel::new(refs),
            per_root,
            providers: Arc::clone(&self.providers),
            complete,
            overlay,
        }))
    }
}
