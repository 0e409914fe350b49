use crate::hash::Hash;
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable integer surrogate for a `(hash, root)` pair, allocated by the index store
pub type CommitIndex = u32;

/// A commit identified by its hash within a repository root
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitId {
    pub hash: Hash,
    pub root: PathBuf,
}

impl CommitId {
    pub fn new(hash: Hash, root: impl Into<PathBuf>) -> Self {
        Self {
            hash,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash.short(), self.root.display())
    }
}

/// A node of the commit graph: parents are ordered, first parent first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphCommit {
    pub id: CommitIndex,
    pub parents: Vec<CommitIndex>,
    pub timestamp: i64,
}

impl GraphCommit {
    pub fn new(id: CommitIndex, parents: Vec<CommitIndex>, timestamp: i64) -> Self {
        Self {
            id,
            parents,
            timestamp,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }
}

/// A commit as reported by a provider, before hashes are turned into indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedCommit {
    pub hash: Hash,
    pub parents: Vec<Hash>,
    pub timestamp: i64,
}

impl TimedCommit {
    pub fn new(hash: Hash, parents: Vec<Hash>, timestamp: i64) -> Self {
        Self {
            hash,
            parents,
            timestamp,
        }
    }
}

/// Author or committer identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcsUser {
    pub name: String,
    pub email: String,
}

impl VcsUser {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for VcsUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.email.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} <{}>", self.name, self.email)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_structural_equality() {
        let a = CommitId::new(Hash::from_bytes(&[1, 2, 3]), "/repo");
        let b = CommitId::new(Hash::from_bytes(&[1, 2, 3]), PathBuf::from("/repo"));
        let c = CommitId::new(Hash::from_bytes(&[1, 2, 3]), "/other");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_merge_commit() {
        let commit = GraphCommit::new(3, vec![1, 2], 100);
        assert!(commit.is_merge());
        assert!(!commit.is_initial());
        assert!(GraphCommit::new(0, vec![], 0).is_initial());
    }

    #[test]
    fn test_user_display() {
        assert_eq!(
            VcsUser::new("John Doe", "john@example.com").to_string(),
            "John Doe <john@example.com>"
        );
        assert_eq!(VcsUser::new("bot", "").to_string(), "bot");
    }
}
