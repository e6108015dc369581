//! Retrieval: mapping entry, piece gets, joiner, verified plaintext

use super::{EncryptedBackup, Issue};
use crate::chunk::{hash_file, mapping_blob_name, FileInfo, Joiner};
use crate::error::{Error, Result};
use crate::metadata::{temp_path_for, Outcome, StatusRecord};
use crate::transfer::{with_retry, TransferApi};
use crate::tree::{join_local, normalize_local_path};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Result of restoring many files
#[derive(Debug, Clone, Default)]
pub struct RetrieveReport {
    pub restored: Vec<String>,
    /// Already present at the target with the recorded hash
    pub skipped: Vec<String>,
    pub issues: Vec<Issue>,
}

impl<T: TransferApi> EncryptedBackup<T> {
    fn pieces_of(&self, local_path: &str) -> Result<Vec<FileInfo>> {
        self.mapping
            .get(local_path)
            .map(<[FileInfo]>::to_vec)
            .ok_or_else(|| Error::NotFound(local_path.to_string()))
    }

    /// Fetch, decrypt and verify every piece of `local_path` into `out`
    async fn join_into<W: Write>(&mut self, local_path: &str, out: W) -> Result<W> {
        let pieces = self.pieces_of(local_path)?;
        self.ensure_connected().await?;

        let result = async {
            let mut joiner = Joiner::new(&self.codec, &pieces, out)?;
            while let Some(piece) = joiner.next_piece() {
                let transfer = &self.transfer;
                let name = piece.piece_name.as_str();
                let what = format!("get {}", name);
                let blob = with_retry(&self.options.retry, &what, move || transfer.get(name)).await?;
                joiner.push(&blob)?;
            }
            joiner.finish()
        }
        .await;

        if let Err(e) = &result {
            if matches!(e, Error::Integrity(_) | Error::NotFound(_)) {
                warn!("{}: {}", local_path, e);
                self.flag_for_rescan(local_path)?;
            }
        }
        result
    }

    /// Restore one file to `target`
    ///
    /// The target is only replaced once the joined plaintext has verified.
    pub async fn retrieve(&mut self, local_path: &str, target: &Path) -> Result<()> {
        let result = self.retrieve_to(local_path, target).await;
        self.disconnect().await;
        result
    }

    async fn retrieve_to(&mut self, local_path: &str, target: &Path) -> Result<()> {
        let local_path = normalize_local_path(local_path);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = temp_path_for(target)?;
        let result = async {
            let out = BufWriter::new(File::create(&temp)?);
            let out = self.join_into(&local_path, out).await?;
            let file = out
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?;
            file.sync_all()?;
            fs::rename(&temp, target)?;
            Ok::<(), Error>(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result?;

        debug!("Restored {} to {}", local_path, target.display());
        Ok(())
    }

    /// Restore one file into memory
    pub async fn retrieve_bytes(&mut self, local_path: &str) -> Result<Vec<u8>> {
        let local_path = normalize_local_path(local_path);
        let result = self.join_into(&local_path, Vec::new()).await;
        self.disconnect().await;
        result
    }

    /// Restore every mapped file whose local path matches `pattern`
    ///
    /// Files already present under `target_root` with the recorded hash are
    /// left alone. Failures are collected, not returned.
    pub async fn retrieve_all(&mut self, target_root: &Path, pattern: &str) -> Result<RetrieveReport> {
        let regex = Regex::new(pattern)?;
        let selected: Vec<(String, String, u64)> = self
            .mapping
            .items()
            .filter(|(local_path, _)| regex.is_match(local_path))
            .filter_map(|(local_path, pieces)| {
                let first = pieces.first()?;
                Some((local_path.to_string(), first.sha256.clone(), first.plain_size))
            })
            .collect();

        info!(
            "Restoring {} files into {}",
            selected.len(),
            target_root.display()
        );

        let mut report = RetrieveReport::default();
        for (local_path, sha256, plain_size) in selected {
            let target = match join_local(target_root, &local_path) {
                Ok(target) => target,
                Err(e) => {
                    error!("{}: {}", local_path, e);
                    report.issues.push(Issue::new(&local_path, &e));
                    continue;
                }
            };
            if target.is_file() {
                if let Ok(digest) = hash_file(&target) {
                    if digest.sha256 == sha256 && digest.size == plain_size {
                        debug!("{}: already restored", local_path);
                        report.skipped.push(local_path);
                        continue;
                    }
                }
            }

            match self.retrieve_to(&local_path, &target).await {
                Ok(()) => report.restored.push(local_path),
                Err(e) => {
                    error!("{}: {}", local_path, e);
                    report.issues.push(Issue::new(&local_path, &e));
                }
            }
        }

        self.disconnect().await;
        info!(
            "Restore finished: {} restored, {} already present, {} issues",
            report.restored.len(),
            report.skipped.len(),
            report.issues.len()
        );
        Ok(report)
    }

    /// Replace the local mapping with the encrypted copy kept on the sink
    ///
    /// Returns the number of mapped files.
    pub async fn load_mapping_from_sink(&mut self) -> Result<usize> {
        let result = self.fetch_mapping().await;
        self.disconnect().await;
        result
    }

    async fn fetch_mapping(&mut self) -> Result<usize> {
        self.ensure_connected().await?;
        let name = mapping_blob_name(self.codec.fingerprint());

        let transfer = &self.transfer;
        let name_ref = name.as_str();
        let blob = with_retry(&self.options.retry, "get mapping", move || {
            transfer.get(name_ref)
        })
        .await?;

        let plain = self.codec.decrypt(&blob, None)?;
        let text = String::from_utf8(plain)
            .map_err(|e| Error::Integrity(format!("{} is not UTF-8: {}", name, e)))?;
        let count = self.mapping.replace_all(&text)?;
        info!("Loaded mapping of {} files from {}", count, name);
        Ok(count)
    }

    /// Check that every mapped piece is still on the sink
    ///
    /// Entries with a missing piece are flagged for rescan and returned.
    pub async fn verify_remote(&mut self) -> Result<Vec<String>> {
        let result = self.find_incomplete().await;
        self.disconnect().await;
        result
    }

    async fn find_incomplete(&mut self) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        let prefix = format!("{}/", self.codec.fingerprint());

        let transfer = &self.transfer;
        let prefix_ref = prefix.as_str();
        let present: BTreeSet<String> = with_retry(&self.options.retry, "list", move || {
            transfer.list_prefix(prefix_ref)
        })
        .await?
        .into_iter()
        .collect();

        let incomplete: Vec<String> = self
            .mapping
            .items()
            .filter(|(_, pieces)| {
                pieces
                    .iter()
                    .any(|piece| !present.contains(piece.piece_name.as_str()))
            })
            .map(|(local_path, _)| local_path.to_string())
            .collect();

        for local_path in &incomplete {
            warn!("{}: pieces missing on the sink", local_path);
            self.flag_for_rescan(local_path)?;
        }
        info!(
            "Verified {} mapped files, {} incomplete",
            self.mapping.len(),
            incomplete.len()
        );
        Ok(incomplete)
    }

    /// Make the next backup run upload `local_path` again
    ///
    /// The mapping entry is kept; only the status record turns `FAILED`.
    pub fn flag_for_rescan(&mut self, local_path: &str) -> Result<()> {
        let record = match self.status.get(local_path) {
            Some(record) => StatusRecord {
                outcome: Outcome::Failed,
                ..record.clone()
            },
            None => {
                let first = self
                    .mapping
                    .get(local_path)
                    .and_then(|pieces| pieces.first())
                    .ok_or_else(|| Error::NotFound(local_path.to_string()))?;
                StatusRecord {
                    local_path: local_path.to_string(),
                    sha256: first.sha256.clone(),
                    plain_size: first.plain_size,
                    mtime: first.mtime,
                    last_transfer: self.clock.epoch(),
                    outcome: Outcome::Failed,
                }
            }
        };
        self.status.upsert(record)?;
        self.status.flush()
    }
}
