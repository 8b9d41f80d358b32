// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Folder-per-resource storage shared by topologies, scenarios, CTFd data and pools
//!
//! Every resource lives in `<base>/<id>/` where `id` is a short alphanumeric
//! string. Ids coming from requests are checked against the pattern and must
//! resolve (after symlinks) to a directory inside the base folder.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

static FOLDER_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]+$").expect("folder id pattern is valid")
});

pub const ID_LENGTH: usize = 6;

#[derive(Error, Debug)]
pub enum FolderError {
    #[error("invalid id")]
    InvalidId,

    #[error("not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file read back from a resource folder
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub name: String,
    pub content: Vec<u8>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn modified_at(path: &Path) -> std::io::Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(fs::metadata(path)?.modified()?))
}

#[derive(Debug, Clone)]
pub struct FolderStore {
    base: PathBuf,
}

impl FolderStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `id` to its folder, rejecting malformed ids and escapes from the base
    pub fn validate(&self, id: &str) -> Result<PathBuf, FolderError> {
        if id.is_empty() || !FOLDER_ID.is_match(id) {
            return Err(FolderError::InvalidId);
        }
        let candidate = self.base.join(id);
        let resolved = match candidate.canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(FolderError::NotFound),
            Err(e) => return Err(FolderError::Io(e)),
        };
        let base = self.base.canonicalize()?;
        if !resolved.starts_with(&base) || resolved == base {
            warn!("Folder id {} resolves outside {}", id, base.display());
            return Err(FolderError::InvalidId);
        }
        if !resolved.is_dir() {
            return Err(FolderError::NotFound);
        }
        Ok(resolved)
    }

    /// Pick an id that is not yet taken in the base folder
    pub fn generate_id(&self) -> String {
        loop {
            let id = random_string(ID_LENGTH);
            if !self.base.join(&id).exists() {
                return id;
            }
        }
    }

    /// Create a fresh, empty resource folder
    pub fn create(&self) -> Result<(String, PathBuf), FolderError> {
        fs::create_dir_all(&self.base)?;
        let id = self.generate_id();
        let path = self.base.join(&id);
        fs::create_dir_all(&path)?;
        Ok((id, path))
    }

    /// First regular file of the resource folder
    pub fn first_file(&self, id: &str) -> Result<StoredFile, FolderError> {
        let dir = self.validate(id)?;
        read_first_file(&dir)
    }

    /// Replace the folder contents with a single file. Creates a new id when `id` is None.
    pub fn replace_file(&self, id: Option<&str>, file_name: &str, content: &[u8]) -> Result<String, FolderError> {
        let file_name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or(FolderError::InvalidId)?
            .to_string();

        let (id, dir) = match id {
            Some(id) => {
                let dir = self.validate(id)?;
                fs::remove_dir_all(&dir)?;
                fs::create_dir_all(&dir)?;
                (id.to_string(), dir)
            }
            None => self.create()?,
        };
        fs::write(dir.join(file_name), content)?;
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> Result<(), FolderError> {
        let dir = self.validate(id)?;
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// All resource folders, oldest first
    pub fn list(&self) -> Result<Vec<ItemInfo>, FolderError> {
        let mut items = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else { continue };
            match modified_at(&entry.path()) {
                Ok(created_at) => items.push(ItemInfo { id, created_at }),
                Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Number of resource folders; 0 when the base folder is unreadable
    pub fn count(&self) -> usize {
        fs::read_dir(&self.base)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }
}

pub fn read_first_file(dir: &Path) -> Result<StoredFile, FolderError> {
    let mut names: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    names.sort();
    let path = names.into_iter().next().ok_or(FolderError::NotFound)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(StoredFile {
        name,
        content: fs::read(&path)?,
        modified: modified_at(&path)?,
    })
}
