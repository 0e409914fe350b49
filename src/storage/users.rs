// User registry - interns author/committer identities to small stable integers
// Stored in <storage dir>/users.txt as a simple text file, one user per line

use crate::commit::VcsUser;
use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

pub const USERS_FILE_NAME: &str = "users.txt";

pub struct UserRegistry {
    file: Option<Mutex<UsersFile>>,
    by_user: DashMap<VcsUser, u32>,
    by_index: DashMap<u32, VcsUser>,
    next: AtomicU32,
}

struct UsersFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl UserRegistry {
    pub fn in_memory() -> Self {
        Self {
            file: None,
            by_user: DashMap::new(),
            by_index: DashMap::new(),
            next: AtomicU32::new(0),
        }
    }

    /// Load from `dir/users.txt`. Never fails: unreadable storage gives an in-memory registry.
    pub fn open(dir: &Path) -> Self {
        match Self::load(dir) {
            Ok(registry) => registry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "users.fallback_in_memory");
                Self::in_memory()
            }
        }
    }

    fn load(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(USERS_FILE_NAME);
        let mut registry = Self::in_memory();

        if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read user registry")?;

            for (line_num, line) in content.lines().enumerate() {
                if line.trim().is_empty() || line.starts_with('#') {
                    continue;
                }

                // Parse: index \t name \t email
                let parts: Vec<&str> = line.split('\t').collect();
                let parsed = match parts.as_slice() {
                    [index, name, email] => index
                        .parse::<u32>()
                        .ok()
                        .and_then(|i| Some((i, i.checked_add(1)?, name, email))),
                    _ => None,
                };
                let Some((index, next, name, email)) = parsed else {
                    warn!(line = line_num + 1, "users.invalid_line_skipped");
                    continue;
                };

                let user = VcsUser::new(*name, *email);
                if registry.by_index.contains_key(&index) || registry.by_user.contains_key(&user) {
                    warn!(line = line_num + 1, index, "users.duplicate_line_skipped");
                    continue;
                }
                registry.by_index.insert(index, user.clone());
                registry.by_user.insert(user, index);
                registry.next.fetch_max(next, Ordering::SeqCst);
            }
        } else {
            fs::write(&path, "# Format: index\\tname\\temail\n")
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }

        registry.file = Some(Mutex::new(UsersFile { path, writer: None }));
        Ok(registry)
    }

    /// Index of `user`, allocating one on first sight
    pub fn user_index(&self, user: &VcsUser) -> u32 {
        if let Some(index) = self.by_user.get(user) {
            return *index;
        }

        let user = sanitize(user);
        let (index, fresh) = match self.by_user.entry(user.clone()) {
            Entry::Occupied(entry) => (*entry.get(), false),
            Entry::Vacant(entry) => {
                let index = self.next.fetch_add(1, Ordering::SeqCst);
                self.by_index.insert(index, user.clone());
                entry.insert(index);
                (index, true)
            }
        };

        if fresh {
            if let Some(file) = &self.file {
                if let Err(err) = file.lock().append(index, &user) {
                    warn!(error = %err, "users.append_failed");
                }
            }
        }
        index
    }

    pub fn user(&self, index: u32) -> Option<VcsUser> {
        self.by_index.get(&index).map(|user| user.clone())
    }

    pub fn users_by_name(&self, name: &str) -> Vec<VcsUser> {
        let mut users: Vec<VcsUser> = self
            .by_user
            .iter()
            .filter(|entry| entry.key().name == name)
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }

    pub fn user_by_email(&self, email: &str) -> Option<VcsUser> {
        self.by_user
            .iter()
            .find(|entry| entry.key().email.eq_ignore_ascii_case(email))
            .map(|entry| entry.key().clone())
    }

    pub fn all_users(&self) -> Vec<VcsUser> {
        let mut users: Vec<(u32, VcsUser)> = self
            .by_index
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        users.sort_by_key(|(index, _)| *index);
        users.into_iter().map(|(_, user)| user).collect()
    }

    pub fn flush(&self) -> Result<()> {
        match &self.file {
            Some(file) => file.lock().flush(),
            None => Ok(()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

impl UsersFile {
    fn append(&mut self, index: u32, user: &VcsUser) -> Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open user registry {:?}", self.path))?;
            self.writer = Some(BufWriter::new(file));
        }

        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}\t{}\t{}", index, user.name, user.email)
                .context("Failed to append to user registry")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for UsersFile {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), error = %err, "users.flush_failed");
        }
    }
}

/// Tabs and newlines would break the line format
fn sanitize(user: &VcsUser) -> VcsUser {
    let clean = |s: &str| s.replace(['\t', '\n', '\r'], " ");
    VcsUser::new(clean(&user.name), clean(&user.email))
}
