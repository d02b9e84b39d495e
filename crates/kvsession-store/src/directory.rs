//! Per-user conversation directories.
//!
//! Layout: `{root}/{username}/sessions/{name}/`. Freshly allocated
//! conversations are named by a numeric ID, one above the largest existing
//! numeric name. Renamed conversations may carry any valid name.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, StoreError};

/// Owns the on-disk conversation hierarchy and tracks the active directory.
#[derive(Debug, Clone)]
pub struct SessionDirectories {
    root: PathBuf,
    active: Option<PathBuf>,
}

impl SessionDirectories {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            active: None,
        }
    }

    /// `{root}/{username}/sessions`.
    pub fn sessions_dir(&self, username: &str) -> Result<PathBuf> {
        validate_name(username)?;
        Ok(self.root.join(username).join("sessions"))
    }

    /// Create the next numeric conversation directory for `username`.
    pub fn allocate(&self, username: &str) -> Result<PathBuf> {
        let base = self.sessions_dir(username)?;
        fs::create_dir_all(&base)?;

        let mut next = match numeric_ids(&base)?.into_iter().map(|(id, _)| id).max() {
            Some(max) => successor(max)?,
            None => 0,
        };
        loop {
            let path = base.join(next.to_string());
            match fs::create_dir(&path) {
                Ok(()) => {
                    info!(user = username, id = next, path = %path.display(), "Allocated conversation");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => next = successor(next)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Mark `path` as the process's current conversation.
    pub fn set_active(&mut self, path: impl Into<PathBuf>) {
        self.active = Some(path.into());
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    pub fn active(&self) -> Option<&Path> {
        self.active.as_deref()
    }

    /// Make an existing conversation the active one.
    pub fn open(&mut self, username: &str, name: &str) -> Result<PathBuf> {
        let path = self.conversation_path(username, name)?;
        if !path.is_dir() {
            return Err(not_found(username, name));
        }
        info!(user = username, conversation = name, "Opened conversation");
        self.set_active(path.clone());
        Ok(path)
    }

    /// Remove a conversation directory and everything in it.
    pub fn delete(&self, username: &str, name: &str) -> Result<()> {
        let path = self.conversation_path(username, name)?;
        if self.is_active(&path) {
            return Err(StoreError::ActiveSessionConflict(name.to_string()));
        }
        if !path.is_dir() {
            return Err(not_found(username, name));
        }
        fs::remove_dir_all(&path)?;
        info!(user = username, conversation = name, "Deleted conversation");
        Ok(())
    }

    pub fn rename(&self, username: &str, old: &str, new: &str) -> Result<PathBuf> {
        let from = self.conversation_path(username, old)?;
        let to = self.conversation_path(username, new)?;
        if self.is_active(&from) {
            return Err(StoreError::ActiveSessionConflict(old.to_string()));
        }
        if !from.is_dir() {
            return Err(not_found(username, old));
        }
        if to.exists() {
            return Err(StoreError::NameCollision(new.to_string()));
        }
        fs::rename(&from, &to)?;
        info!(user = username, from = old, to = new, "Renamed conversation");
        Ok(to)
    }

    /// Delete every numeric conversation of `username` except the active one.
    ///
    /// Returns how many directories were removed.
    pub fn erase_all_except_active(&self, username: &str) -> Result<usize> {
        let base = self.existing_sessions_dir(username)?;
        let mut removed = 0;
        for (_, name) in numeric_ids(&base)? {
            let path = base.join(name);
            if self.is_active(&path) {
                continue;
            }
            fs::remove_dir_all(&path)?;
            removed += 1;
        }
        info!(user = username, removed, "Erased conversations");
        Ok(removed)
    }

    /// Conversation names for `username`, sorted lexicographically.
    ///
    /// Numeric names only sort numerically when they have the same number of
    /// digits (`"10"` sorts before `"9"`).
    pub fn list(&self, username: &str) -> Result<Vec<String>> {
        let base = self.existing_sessions_dir(username)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Path of a named conversation. Does not check that it exists.
    pub fn conversation_path(&self, username: &str, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.sessions_dir(username)?.join(name))
    }

    fn existing_sessions_dir(&self, username: &str) -> Result<PathBuf> {
        let base = self.sessions_dir(username)?;
        if !base.is_dir() {
            return Err(StoreError::UserNotFound(username.to_string()));
        }
        Ok(base)
    }

    fn is_active(&self, path: &Path) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        match (fs::canonicalize(active), fs::canonicalize(path)) {
            (Ok(a), Ok(p)) => a == p,
            _ => active == path,
        }
    }
}

fn not_found(username: &str, name: &str) -> StoreError {
    StoreError::ConversationNotFound {
        username: username.to_string(),
        name: name.to_string(),
    }
}

/// Names used as a single path component must not escape their parent.
fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn successor(id: u64) -> Result<u64> {
    id.checked_add(1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "conversation ids exhausted").into())
}

/// All-digit subdirectories of `base`, as `(id, directory name)`.
///
/// `007` parses as 7 but keeps its on-disk name.
fn numeric_ids(base: &Path) -> Result<Vec<(u64, OsString)>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(text) = name.to_str() else { continue };
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = text.parse() {
                ids.push((id, name));
            }
        }
    }
    Ok(ids)
}
