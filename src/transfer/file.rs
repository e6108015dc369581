//! Local directory sink
//!
//! `put` writes `root/name` through a sibling temp file and a rename, so a
//! crashed upload never leaves a truncated blob under the final name.

use super::{validate_name, TransferApi};
use crate::error::{Error, Result};
use crate::metadata::temp_path_for;
use crate::tree::{join_local, normalize_local_path};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

/// Sink rooted at a local (or mounted) directory
#[derive(Debug, Clone)]
pub struct FileTransfer {
    root: PathBuf,
}

impl FileTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileTransfer { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        join_local(&self.root, name)
    }
}

/// Map local I/O failures onto the sink error categories
fn classify(e: io::Error, name: &str) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(name.to_string()),
        io::ErrorKind::PermissionDenied => {
            Error::fatal(format!("Permission denied for {}: {}", name, e))
        }
        _ => Error::Transport(format!("{}: {}", name, e)),
    }
}

fn is_temp_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.contains(".tmp-")
}

#[async_trait]
impl TransferApi for FileTransfer {
    fn name(&self) -> &str {
        "file"
    }

    async fn connect(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| classify(e, &self.root.display().to_string()))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| classify(e, name))?;
        }

        let temp = temp_path_for(&path)?;
        let write = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&temp, &path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp).await;
            return Err(classify(e, name));
        }

        debug!("Stored {} ({} bytes)", name, data.len());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name)?;
        fs::read(&path).await.map_err(|e| classify(e, name))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| {
                    Error::Transport(format!("Listing {}: {}", root.display(), e))
                })?;
                if !entry.file_type().is_file()
                    || is_temp_name(&entry.file_name().to_string_lossy())
                {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let name = normalize_local_path(&relative.to_string_lossy());
                if name.starts_with(&prefix) {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(|e| Error::Internal(format!("Listing task failed: {}", e)))??;

        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify(e, name)),
        }
    }
}
