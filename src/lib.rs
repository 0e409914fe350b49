pub mod cancel;
pub mod commit;
pub mod config;
pub mod detail_cache;
pub mod details;
pub mod error;
pub mod hash;
pub mod join;
pub mod log_data;
pub mod provider;
pub mod refresher;
pub mod refs;
pub mod snapshot;
pub mod storage;

use std::result;

pub type Result<T> = result::Result<T, anyhow::Error>;

pub use cancel::CancellationToken;
pub use commit::{CommitId, CommitIndex, GraphCommit, TimedCommit, VcsUser};
pub use config::LogConfig;
pub use detail_cache::{CacheEntry, DetailCache, DetailFetcher};
pub use details::{
    Change, ChangeKind, CommitDetails, CommitMetadata, Detail, FullDetailsFetcher, MetadataFetcher,
};
pub use error::{is_cancellation, LogError};
pub use hash::Hash;
pub use log_data::{DetailsCache, MetadataCache, VcsLogData};
pub use provider::{CommitOrdering, LogProvider, Providers, RecentBlock, RecentRequest};
pub use refresher::{LogRefresher, RefreshRequest, RefresherState};
pub use refs::{RefKind, RefsModel, RefsSnapshot, VcsRef};
pub use snapshot::{CommitGraph, CommitGraphSnapshot, GraphData, SnapshotBuilder};
pub use storage::{open_index_store, CommitIndexStore, UserRegistry};
