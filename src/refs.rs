use crate::commit::CommitIndex;
use crate::error::LogError;
use crate::hash::Hash;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Head,
    LocalBranch,
    RemoteBranch,
    Tag,
}

impl RefKind {
    pub fn is_branch(self) -> bool {
        !matches!(self, RefKind::Tag)
    }

    pub fn as_byte(self) -> u8 {
        match self {
            RefKind::Head => 0,
            RefKind::LocalBranch => 1,
            RefKind::RemoteBranch => 2,
            RefKind::Tag => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RefKind::Head),
            1 => Some(RefKind::LocalBranch),
            2 => Some(RefKind::RemoteBranch),
            3 => Some(RefKind::Tag),
            _ => None,
        }
    }
}

/// A branch or tag reference pointing at a commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcsRef {
    pub hash: Hash,
    pub name: String, // "main", "origin/main", "v1.0"
    pub kind: RefKind,
    pub root: PathBuf,
}

impl VcsRef {
    pub fn new(hash: Hash, name: impl Into<String>, kind: RefKind, root: impl Into<PathBuf>) -> Self {
        Self {
            hash,
            name: name.into(),
            kind,
            root: root.into(),
        }
    }

    /// Same ref, possibly pointing somewhere else
    fn same_ref(&self, other: &VcsRef) -> bool {
        self.name == other.name && self.kind == other.kind && self.root == other.root
    }
}

/// References of a single root, indexed by the commit they point at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefsSnapshot {
    root: PathBuf,
    branches: HashMap<CommitIndex, Vec<VcsRef>>,
    tags: HashMap<CommitIndex, Vec<VcsRef>>,
}

impl RefsSnapshot {
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            branches: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    /// Build from resolved `(commit index, ref)` pairs. Every ref must belong to `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        refs: impl IntoIterator<Item = (CommitIndex, VcsRef)>,
    ) -> Result<Self, LogError> {
        let mut snapshot = Self::empty(root);

        for (index, vcs_ref) in refs {
            if vcs_ref.root != snapshot.root {
                return Err(LogError::MixedRoots {
                    expected: snapshot.root.clone(),
                    found: vcs_ref.root,
                });
            }

            let target = if vcs_ref.kind.is_branch() {
                &mut snapshot.branches
            } else {
                &mut snapshot.tags
            };
            let at_commit = target.entry(index).or_default();
            if !at_commit.contains(&vcs_ref) {
                at_commit.push(vcs_ref);
            }
        }

        for refs in snapshot
            .branches
            .values_mut()
            .chain(snapshot.tags.values_mut())
        {
            refs.sort();
        }

        Ok(snapshot)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Does any branch or tag point at `index`?
    pub fn contains(&self, index: CommitIndex) -> bool {
        self.branches.contains_key(&index) || self.tags.contains_key(&index)
    }

    pub fn is_branch_head(&self, index: CommitIndex) -> bool {
        self.branches.contains_key(&index)
    }

    /// Branches first, then tags
    pub fn refs_at(&self, index: CommitIndex) -> Vec<&VcsRef> {
        let branches = self.branches.get(&index).into_iter().flatten();
        let tags = self.tags.get(&index).into_iter().flatten();
        branches.chain(tags).collect()
    }

    pub fn branches_at(&self, index: CommitIndex) -> &[VcsRef] {
        self.branches.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tags_at(&self, index: CommitIndex) -> &[VcsRef] {
        self.tags.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reverse lookup: commits the given ref (by name, kind and root) points at
    pub fn commits_of(&self, vcs_ref: &VcsRef) -> HashSet<CommitIndex> {
        let source = if vcs_ref.kind.is_branch() {
            &self.branches
        } else {
            &self.tags
        };

        source
            .iter()
            .filter(|(_, refs)| refs.iter().any(|r| r.same_ref(vcs_ref)))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Every commit pointed at by some ref
    pub fn ref_commits(&self) -> HashSet<CommitIndex> {
        self.branches
            .keys()
            .chain(self.tags.keys())
            .copied()
            .collect()
    }

    pub fn all_refs(&self) -> impl Iterator<Item = (CommitIndex, &VcsRef)> {
        self.branches
            .iter()
            .chain(self.tags.iter())
            .flat_map(|(index, refs)| refs.iter().map(move |r| (*index, r)))
    }

    pub fn len(&self) -> usize {
        self.branches.values().map(Vec::len).sum::<usize>()
            + self.tags.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.tags.is_empty()
    }
}

/// Refs of all roots, aggregated
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefsModel {
    by_root: BTreeMap<PathBuf, RefsSnapshot>,
}

impl RefsModel {
    pub fn new(snapshots: impl IntoIterator<Item = RefsSnapshot>) -> Self {
        Self {
            by_root: snapshots
                .into_iter()
                .map(|snapshot| (snapshot.root.clone(), snapshot))
                .collect(),
        }
    }

    pub fn for_root(&self, root: &Path) -> Option<&RefsSnapshot> {
        self.by_root.get(root)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.by_root.keys().map(PathBuf::as_path)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &RefsSnapshot> {
        self.by_root.values()
    }

    pub fn contains(&self, index: CommitIndex) -> bool {
        self.by_root.values().any(|refs| refs.contains(index))
    }

    pub fn refs_at(&self, index: CommitIndex) -> Vec<&VcsRef> {
        self.by_root
            .values()
            .flat_map(|refs| refs.refs_at(index))
            .collect()
    }

    pub fn commits_of(&self, vcs_ref: &VcsRef) -> HashSet<CommitIndex> {
        self.by_root
            .get(&vcs_ref.root)
            .map(|refs| refs.commits_of(vcs_ref))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_root.values().map(RefsSnapshot::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_root.values().all(RefsSnapshot::is_empty)
    }
}
