pub mod file_storage;
pub mod format;
pub mod index_store;
pub mod lock;
pub mod users;

pub use file_storage::{FileStorage, IndexStorage};
pub use format::{FormatError, Record};
pub use index_store::{
    index_all, open_index_store, CommitIndexStore, InMemoryIndexStore, PersistentIndexStore,
};
pub use lock::StorageLock;
pub use users::UserRegistry;
