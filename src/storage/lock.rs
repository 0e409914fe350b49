use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = "storage.lock";

/// Single-open guarantee for a storage directory.
///
/// Holds an exclusive OS lock on `storage.lock` for as long as the handle lives. The OS
/// drops the lock with the process, so a file left behind by a crash is reclaimed by the
/// next `acquire`. The file itself only records the holder's PID for diagnostics.
#[derive(Debug)]
pub struct StorageLock {
    path: PathBuf,
    file: File,
}

impl StorageLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(LOCK_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            anyhow::bail!(
                "Storage at {} is already open (held by pid {})",
                dir.display(),
                holder.trim()
            );
        }

        // Whatever is left here belongs to a process that no longer holds the lock
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!(path = %path.display(), "storage.lock_acquired");

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        // The file stays: unlinking it would let a waiting opener lock an orphaned inode
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "storage.lock_release_failed");
        }
    }
}
