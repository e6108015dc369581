//! Local file tree enumeration
//!
//! Lists regular files under a root as `LocalPath`s: relative, `/`-separated,
//! filtered by an include regex and an optional exclude regex, in
//! lexicographic order. Hidden and version-control directories are skipped.

use crate::error::{Error, Result};
use regex::Regex;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn", ".bzr", "CVS", "__pycache__"];

/// One regular file found under the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub local_path: String,
    pub absolute: PathBuf,
    pub size: u64,
    /// Modification time, Unix seconds
    pub mtime: i64,
}

/// Filtered view of a local directory tree
#[derive(Debug, Clone)]
pub struct FileTreeNode {
    root: PathBuf,
    include: Regex,
    exclude: Option<Regex>,
}

impl FileTreeNode {
    pub fn new(root: impl Into<PathBuf>, include: &str, exclude: Option<&str>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Source root is not a directory: {}",
                root.display()
            )));
        }
        Ok(FileTreeNode {
            root,
            include: Regex::new(include)?,
            exclude: exclude.map(Regex::new).transpose()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a local path passes the include/exclude filters
    pub fn matches(&self, local_path: &str) -> bool {
        self.include.is_match(local_path)
            && !self
                .exclude
                .as_ref()
                .is_some_and(|exclude| exclude.is_match(local_path))
    }

    /// Enumerate matching files, sorted by local path
    pub fn walk(&self) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| Error::Internal(e.to_string()))?;
            let local_path = normalize_local_path(&relative.to_string_lossy());
            if !self.matches(&local_path) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Cannot stat {}: {}", local_path, e);
                    continue;
                }
            };

            entries.push(TreeEntry {
                local_path,
                absolute: entry.path().to_path_buf(),
                size: metadata.len(),
                mtime: mtime_of(&metadata),
            });
        }

        entries.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        debug!("{} files under {}", entries.len(), self.root.display());
        Ok(entries)
    }

    /// Absolute path of a local path under this root
    pub fn absolute_of(&self, local_path: &str) -> Result<PathBuf> {
        join_local(&self.root, local_path)
    }

    /// Current size and mtime of a local path
    ///
    /// Returns `NotFound` if the file no longer exists.
    pub fn stat_of(&self, local_path: &str) -> Result<TreeEntry> {
        let absolute = self.absolute_of(local_path)?;
        let metadata = std::fs::metadata(&absolute).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(local_path.to_string()),
            _ => Error::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(Error::NotFound(format!("{} is not a regular file", local_path)));
        }
        Ok(TreeEntry {
            local_path: normalize_local_path(local_path),
            absolute,
            size: metadata.len(),
            mtime: mtime_of(&metadata),
        })
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || VCS_DIRS.contains(&name.as_ref())
}

/// Modification time of a file in Unix seconds
pub fn mtime_of(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Normalize a path to the `LocalPath` form
///
/// Backslashes become `/`, empty and `.` components are dropped, and the
/// result never starts with `/`.
pub fn normalize_local_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a `LocalPath` onto a directory using the platform separator
///
/// The result always stays under `root`: `..` components and drive or
/// root prefixes are rejected.
pub fn join_local(root: &Path, local_path: &str) -> Result<PathBuf> {
    let normalized = normalize_local_path(local_path);
    if normalized.is_empty() {
        return Err(Error::Config(format!("Empty local path: {:?}", local_path)));
    }
    let mut path = root.to_path_buf();
    for part in normalized.split('/') {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => path.push(part),
            _ => {
                return Err(Error::Config(format!(
                    "Local path escapes its root: {:?}",
                    local_path
                )))
            }
        }
    }
    Ok(path)
}
