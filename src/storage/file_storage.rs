/// Append-only durable storage for index records (commits.idx)
use super::format::{FormatError, Header, Record};
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persistence contract consumed by the index store
pub trait IndexStorage: Send {
    /// Visit every stored record in append order; stop when the visitor returns false
    fn enumerate(&mut self, visitor: &mut dyn FnMut(&Record) -> bool) -> Result<()>;

    fn append(&mut self, record: &Record) -> Result<()>;

    /// Force appended records to disk
    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Drop all content and start over with an empty file
    fn reset(&mut self) -> Result<()>;
}

pub struct FileStorage {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileStorage {
    /// Open (creating if needed) the record file at `path`.
    /// A torn final record left by a crash is cut off; any other damage is a `FormatError`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        if !path.exists() {
            write_fresh(path)?;
        } else {
            let valid_len = scan(path)?;
            let actual_len = fs::metadata(path)?.len();
            if valid_len < actual_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    actual_len,
                    "storage.torn_tail_truncated"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for append", self.path.display()))?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("storage writer unavailable"))
    }
}

impl IndexStorage for FileStorage {
    fn enumerate(&mut self, visitor: &mut dyn FnMut(&Record) -> bool) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }

        let data = fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Header::from_bytes(&data).context("Failed to parse header")?;

        let mut offset = Header::HEADER_SIZE;
        while offset < data.len() {
            let (record, consumed) = Record::decode(&data[offset..])
                .with_context(|| format!("Failed to parse record at offset {}", offset))?;
            offset += consumed;
            if !visitor(&record) {
                break;
            }
        }
        Ok(())
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let bytes = record.encode()?;
        self.writer()?
            .write_all(&bytes)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer
                .get_ref()
                .sync_data()
                .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.writer = None;
        write_fresh(&self.path)?;
        debug!(path = %self.path.display(), "storage.reset");
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), error = %err, "storage.close_failed");
        }
    }
}

/// Write a header-only file atomically (temp file + rename)
fn write_fresh(path: &Path) -> Result<()> {
    let tmp_path = path.with_extension("idx.tmp");

    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .with_context(|| format!("open temp index file {:?}", tmp_path))?;
    f.write_all(&Header::new().to_bytes())
        .with_context(|| format!("write temp index file {:?}", tmp_path))?;
    f.sync_all()
        .with_context(|| format!("sync temp index file {:?}", tmp_path))?;
    drop(f);

    fs::rename(&tmp_path, path).with_context(|| format!("rename {:?} -> {:?}", tmp_path, path))?;
    Ok(())
}

/// Validate the file and return the length of its intact prefix.
/// Only a final record that runs past the end of the file counts as a torn tail.
fn scan(path: &Path) -> Result<u64> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Header::from_bytes(&data)?;

    let mut offset = Header::HEADER_SIZE;
    while offset < data.len() {
        match Record::decode(&data[offset..]) {
            Ok((_, consumed)) => offset += consumed,
            Err(FormatError::Truncated) => {
                debug!(offset, len = data.len(), "storage.torn_tail_found");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(offset as u64)
}
