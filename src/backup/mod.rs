//! Backup orchestrator
//!
//! Walks the source tree one file at a time and decides, per file, whether
//! to skip it, upload it, or record it as failed:
//!
//! - INSPECT: an `OK` status record whose size and mtime match skips the
//!   file without reading it; otherwise the file is hashed and skipped only
//!   if hash and size match.
//! - PREPARE/UPLOAD: the file is split into encrypted pieces, each put with
//!   retries.
//! - COMMIT: once every piece is on the sink the mapping entry is replaced
//!   and the status record becomes `OK`.
//!
//! A failure anywhere before COMMIT leaves the previous mapping entry alone
//! and writes a `FAILED` status record, so the next run retries the file.

mod retrieve;

pub use retrieve::RetrieveReport;

use crate::chunk::{hash_file, mapping_blob_name, FileInfo, PlainDigest, Splitter};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::{Algorithm, BackupKey, ChunkCodec};
use crate::error::{Error, ErrorKind, Result};
use crate::metadata::{MappingStore, Outcome, StatusRecord, StatusStore};
use crate::transfer::{with_retry, RetryPolicy, TransferApi};
use crate::tree::{FileTreeNode, TreeEntry};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Candidates between two progress lines
const PROGRESS_EVERY: usize = 20;

/// Issue label for a failed upload of the mapping copy
pub const MAPPING_ISSUE_LABEL: &str = "<mapping>";

/// Knobs of a backup run
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Maximum plaintext bytes per piece
    pub threshold: u64,
    /// Maximum total ciphertext per file
    pub max_file_size: Option<u64>,
    pub retry: RetryPolicy,
    /// Pause between consecutive puts, unless `start_transfering` overrides it
    pub put_delay: Duration,
    /// Stop the run once this many issues have accumulated
    pub max_issues: Option<usize>,
    /// Keep an encrypted copy of the mapping on the sink
    pub upload_mapping: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            threshold: crate::config::DEFAULT_THRESHOLD_SIZE,
            max_file_size: None,
            retry: RetryPolicy::default(),
            put_delay: Duration::ZERO,
            max_issues: None,
            upload_mapping: true,
        }
    }
}

impl BackupOptions {
    pub fn from_config(config: &Config) -> Self {
        BackupOptions {
            threshold: config.chunk.threshold_size,
            max_file_size: config.chunk.max_file_size,
            retry: config.transfer.retry_policy(),
            put_delay: config.transfer.put_delay(),
            max_issues: config.transfer.max_issues,
            upload_mapping: config.transfer.upload_mapping,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(Error::Config("Threshold must be positive".to_string()));
        }
        if self.max_file_size == Some(0) {
            return Err(Error::Config(
                "Max file size must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// A file that could not be backed up or restored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub local_path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl Issue {
    fn new(local_path: &str, e: &Error) -> Self {
        Issue {
            local_path: local_path.to_string(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result of one backup run
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    /// Uploaded files, in the order they were committed
    pub done: Vec<String>,
    pub issues: Vec<Issue>,
    /// Unchanged or vanished files
    pub skipped: usize,
    /// Ciphertext bytes successfully put, mapping copy included
    pub bytes_sent: u64,
    /// The run stopped before visiting every file
    pub stopped_early: bool,
}

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Uploaded,
    Unchanged,
    Vanished,
}

/// Per-run bookkeeping
#[derive(Debug, Default)]
struct RunState {
    report: TransferReport,
    puts: u64,
    reconnected: bool,
}

/// Ciphertext a file of `size` bytes turns into
fn cipher_total(size: u64, threshold: u64, algorithm: Algorithm) -> u64 {
    if size == 0 {
        return algorithm.cipher_len(0);
    }
    let full = size / threshold;
    let rest = size % threshold;
    let mut total = full.saturating_mul(algorithm.cipher_len(threshold));
    if rest > 0 {
        total = total.saturating_add(algorithm.cipher_len(rest));
    }
    total
}

fn is_missing(e: &Error) -> bool {
    match e {
        Error::NotFound(_) => true,
        Error::Io(io) => io.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

/// Incremental encrypted mirror of one tree onto one sink
pub struct EncryptedBackup<T: TransferApi> {
    tree: FileTreeNode,
    codec: ChunkCodec,
    transfer: T,
    status: StatusStore,
    mapping: MappingStore,
    options: BackupOptions,
    clock: Arc<dyn Clock>,
    connected: bool,
}

impl<T: TransferApi> EncryptedBackup<T> {
    /// Open the local state of a backup
    ///
    /// Options are checked before anything is read; the status file is then
    /// locked for as long as the backup is alive.
    pub fn new(
        tree: FileTreeNode,
        codec: ChunkCodec,
        transfer: T,
        status_file: impl Into<PathBuf>,
        mapping_file: impl Into<PathBuf>,
        options: BackupOptions,
    ) -> Result<Self> {
        options.validate()?;
        let status = StatusStore::open(status_file)?;
        let mapping = MappingStore::load(mapping_file)?;

        debug!(
            "Opened backup of {} onto {} ({} status records, {} mapped files)",
            tree.root().display(),
            transfer.name(),
            status.len(),
            mapping.len()
        );

        Ok(EncryptedBackup {
            tree,
            codec,
            transfer,
            status,
            mapping,
            options,
            clock: Arc::new(SystemClock),
            connected: false,
        })
    }

    /// Build a backup from a configuration file's sections
    pub fn from_config(config: &Config, key: BackupKey, transfer: T) -> Result<Self> {
        config.validate()?;
        let tree = FileTreeNode::new(
            &config.source.root,
            &config.source.include,
            config.source.exclude.as_deref(),
        )?;
        let codec = ChunkCodec::new(key, config.chunk.algorithm);
        Self::new(
            tree,
            codec,
            transfer,
            &config.state.status_file,
            &config.state.mapping_file,
            BackupOptions::from_config(config),
        )
    }

    /// Use `clock` for status timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tree(&self) -> &FileTreeNode {
        &self.tree
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    pub fn mapping(&self) -> &MappingStore {
        &self.mapping
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if !self.connected {
            let transfer = &self.transfer;
            with_retry(&self.options.retry, "connect", move || transfer.connect()).await?;
            self.connected = true;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            if let Err(e) = self.transfer.close().await {
                warn!("Closing {} sink failed: {}", self.transfer.name(), e);
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        info!("Reconnecting to {} sink", self.transfer.name());
        self.disconnect().await;
        self.ensure_connected().await
    }

    /// Back up every new or changed file
    ///
    /// `delay` overrides the configured pause between puts. Per-file failures
    /// are collected in the report; only problems that prevent the run from
    /// starting are returned as errors.
    pub async fn start_transfering(&mut self, delay: Option<Duration>) -> Result<TransferReport> {
        self.options.validate()?;
        let delay = delay.unwrap_or(self.options.put_delay);

        let entries = self.tree.walk()?;
        info!(
            "Backing up {} candidate files from {}",
            entries.len(),
            self.tree.root().display()
        );

        self.ensure_connected().await?;

        let mut run = RunState::default();
        let total = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            if !self.visit(entry, delay, &mut run).await {
                run.report.stopped_early = true;
                break;
            }

            if (i + 1) % PROGRESS_EVERY == 0 {
                info!(
                    "Progress: {}/{} files, {} uploaded, {} bytes sent",
                    i + 1,
                    total,
                    run.report.done.len(),
                    run.report.bytes_sent
                );
            }
        }

        if self.options.upload_mapping && !run.report.done.is_empty() && self.connected {
            if let Err(e) = self.upload_mapping(&mut run).await {
                error!("Uploading mapping copy failed: {}", e);
                run.report.issues.push(Issue::new(MAPPING_ISSUE_LABEL, &e));
            }
        }

        if let Err(e) = self.status.flush() {
            error!("Flushing status file failed: {}", e);
        }
        self.disconnect().await;

        let report = run.report;
        info!(
            "Backup finished: {} uploaded, {} skipped, {} issues, {} bytes sent",
            report.done.len(),
            report.skipped,
            report.issues.len(),
            report.bytes_sent
        );
        Ok(report)
    }

    /// Process one candidate; `false` means the run must stop
    async fn visit(&mut self, entry: &TreeEntry, delay: Duration, run: &mut RunState) -> bool {
        let mut result = self.process_file(entry, delay, run).await;

        if let Err(e) = &result {
            if e.is_connection_lost() {
                if run.reconnected {
                    error!("Connection lost again, stopping: {}", e);
                    run.report.issues.push(Issue::new(&entry.local_path, e));
                    return false;
                }
                run.reconnected = true;
                if let Err(re) = self.reconnect().await {
                    error!("Reconnect failed, stopping: {}", re);
                    run.report.issues.push(Issue::new(&entry.local_path, &re));
                    return false;
                }
                result = self.process_file(entry, delay, run).await;
            }
        }

        match result {
            Ok(FileOutcome::Uploaded) => {
                run.report.done.push(entry.local_path.clone());
            }
            Ok(FileOutcome::Unchanged) | Ok(FileOutcome::Vanished) => {
                run.report.skipped += 1;
            }
            Err(e) => {
                error!("{}: {}", entry.local_path, e);
                run.report.issues.push(Issue::new(&entry.local_path, &e));

                if e.is_connection_lost() {
                    return false;
                }
                if let Some(max) = self.options.max_issues {
                    if run.report.issues.len() >= max {
                        error!("Stopping after {} issues", run.report.issues.len());
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn process_file(
        &mut self,
        entry: &TreeEntry,
        delay: Duration,
        run: &mut RunState,
    ) -> Result<FileOutcome> {
        let local_path = entry.local_path.as_str();

        // INSPECT
        let current = match self.tree.stat_of(local_path) {
            Ok(current) => current,
            Err(e) if is_missing(&e) => return self.mark_vanished(local_path),
            Err(e) => {
                self.record_failure(entry, None);
                return Err(e);
            }
        };

        let previous = self.status.get(local_path).cloned();
        if let Some(prev) = &previous {
            if prev.outcome == Outcome::Ok
                && prev.mtime == current.mtime
                && prev.plain_size == current.size
            {
                debug!("{}: unchanged (mtime)", local_path);
                return Ok(FileOutcome::Unchanged);
            }
        }

        let digest = match hash_file(&current.absolute) {
            Ok(digest) => digest,
            Err(e) if is_missing(&e) => return self.mark_vanished(local_path),
            Err(e) => {
                self.record_failure(&current, None);
                return Err(e);
            }
        };

        if let Some(prev) = previous {
            if prev.is_ok_for(&digest.sha256, digest.size) {
                debug!("{}: touched but identical, refreshing mtime", local_path);
                self.status.upsert(StatusRecord {
                    mtime: current.mtime,
                    ..prev
                })?;
                self.status.flush()?;
                return Ok(FileOutcome::Unchanged);
            }
        }

        // PREPARE, UPLOAD, COMMIT
        match self.upload(&current, &digest, delay, run).await {
            Ok(()) => Ok(FileOutcome::Uploaded),
            Err(e) => {
                self.record_failure(&current, Some(&digest));
                Err(e)
            }
        }
    }

    async fn upload(
        &mut self,
        entry: &TreeEntry,
        digest: &PlainDigest,
        delay: Duration,
        run: &mut RunState,
    ) -> Result<()> {
        let local_path = entry.local_path.as_str();
        let algorithm = self.codec.algorithm();

        if let Some(limit) = self.options.max_file_size {
            let size = cipher_total(digest.size, self.options.threshold, algorithm);
            if size > limit {
                return Err(Error::TooLarge {
                    path: local_path.to_string(),
                    size,
                    limit,
                });
            }
        }

        let splitter = Splitter::new(&self.codec, self.options.threshold)?;
        let mut reader = splitter.open(&entry.absolute, local_path, digest)?;
        let piece_count = reader.piece_count();
        debug!("{}: uploading {} pieces", local_path, piece_count);

        let mut pieces = Vec::with_capacity(piece_count as usize);
        while let Some(piece) = reader.next_piece()? {
            if run.puts > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            run.puts += 1;

            let transfer = &self.transfer;
            let name = piece.name.as_str();
            let data = piece.data.as_slice();
            let what = format!("put {}", name);
            with_retry(&self.options.retry, &what, move || transfer.put(name, data)).await?;
            run.report.bytes_sent += data.len() as u64;

            pieces.push(FileInfo {
                local_path: local_path.to_string(),
                piece_name: piece.name.clone(),
                piece_index: piece.index,
                piece_count,
                cipher_size: piece.data.len() as u64,
                plain_size: digest.size,
                sha256: digest.sha256.clone(),
                mtime: entry.mtime,
                algorithm,
            });
        }

        self.mapping.set(local_path, pieces)?;
        self.status.upsert(StatusRecord {
            local_path: local_path.to_string(),
            sha256: digest.sha256.clone(),
            plain_size: digest.size,
            mtime: entry.mtime,
            last_transfer: self.clock.epoch(),
            outcome: Outcome::Ok,
        })?;
        self.status.flush()?;
        debug!("{}: committed", local_path);
        Ok(())
    }

    async fn upload_mapping(&mut self, run: &mut RunState) -> Result<()> {
        let name = mapping_blob_name(self.codec.fingerprint());
        let blob = self.codec.encrypt(self.mapping.serialize().as_bytes())?;

        let transfer = &self.transfer;
        let (name_ref, data) = (name.as_str(), blob.as_slice());
        with_retry(&self.options.retry, "put mapping", move || {
            transfer.put(name_ref, data)
        })
        .await?;

        run.report.bytes_sent += blob.len() as u64;
        debug!("Stored mapping copy as {}", name);
        Ok(())
    }

    fn mark_vanished(&mut self, local_path: &str) -> Result<FileOutcome> {
        debug!("{}: vanished before it could be read", local_path);
        let previous = self.status.get(local_path).cloned();
        self.status.upsert(StatusRecord {
            local_path: local_path.to_string(),
            sha256: previous.as_ref().map(|r| r.sha256.clone()).unwrap_or_default(),
            plain_size: previous.as_ref().map_or(0, |r| r.plain_size),
            mtime: previous.as_ref().map_or(0, |r| r.mtime),
            last_transfer: self.clock.epoch(),
            outcome: Outcome::Skipped,
        })?;
        self.status.flush()?;
        Ok(FileOutcome::Vanished)
    }

    fn record_failure(&mut self, entry: &TreeEntry, digest: Option<&PlainDigest>) {
        let record = StatusRecord {
            local_path: entry.local_path.clone(),
            sha256: digest.map(|d| d.sha256.clone()).unwrap_or_default(),
            plain_size: digest.map_or(entry.size, |d| d.size),
            mtime: entry.mtime,
            last_transfer: self.clock.epoch(),
            outcome: Outcome::Failed,
        };
        if let Err(e) = self.status.upsert(record).and_then(|_| self.status.flush()) {
            error!("{}: could not record failure: {}", entry.local_path, e);
        }
    }
}
