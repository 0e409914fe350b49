use crate::commit::CommitIndex;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Log data has been disposed")]
    Disposed,

    #[error("No provider registered for root {0}")]
    UnknownRoot(PathBuf),

    #[error("Refs from {found} mixed into refs snapshot of {expected}")]
    MixedRoots { expected: PathBuf, found: PathBuf },

    #[error("Unknown commit index: {0}")]
    UnknownCommit(CommitIndex),
}

/// Cancellation is a distinguished outcome, not a failure to report
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LogError>(), Some(LogError::Cancelled))
}
