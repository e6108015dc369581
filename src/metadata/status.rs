//! Status store
//!
//! One line per record:
//! `localPath \t sha256 \t plainSize \t mtime \t lastTransfer \t outcome`.
//! Records are appended on flush; when a path appears more than once the
//! last line wins.

use super::{atomic_write, check_local_path, parse_field, split_fields, StatusLock};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const HEADER: &str = "# cryptmirror status v1";
const FIELDS: usize = 6;

/// Result of the last encounter with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Ok,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::Failed => "FAILED",
            Outcome::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(Outcome::Ok),
            "FAILED" => Ok(Outcome::Failed),
            "SKIPPED" => Ok(Outcome::Skipped),
            other => Err(Error::Config(format!("Unknown outcome: {}", other))),
        }
    }
}

/// Per-file status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub local_path: String,
    pub sha256: String,
    pub plain_size: u64,
    pub mtime: i64,
    /// Unix seconds of the last transfer attempt that decided this record
    pub last_transfer: i64,
    pub outcome: Outcome,
}

impl StatusRecord {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            self.local_path,
            self.sha256,
            self.plain_size,
            self.mtime,
            self.last_transfer,
            self.outcome
        )
    }

    fn parse_line(line: &str, file: &Path, line_no: usize) -> Result<Self> {
        let fields = split_fields(line, FIELDS, file, line_no)?;
        Ok(StatusRecord {
            local_path: fields[0].to_string(),
            sha256: fields[1].to_string(),
            plain_size: parse_field(fields[2], "size", file, line_no)?,
            mtime: parse_field(fields[3], "mtime", file, line_no)?,
            last_transfer: parse_field(fields[4], "transfer time", file, line_no)?,
            outcome: fields[5]
                .parse()
                .map_err(|_| super::corrupt(file, line_no, "unknown outcome"))?,
        })
    }

    /// Whether this record proves the file with the given content is backed up
    pub fn is_ok_for(&self, sha256: &str, plain_size: u64) -> bool {
        self.outcome == Outcome::Ok && self.sha256 == sha256 && self.plain_size == plain_size
    }
}

/// Persistent status records keyed by local path
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    records: BTreeMap<String, StatusRecord>,
    pending: Vec<StatusRecord>,
    /// Lines on disk that a later line superseded
    dead_lines: usize,
    _lock: Option<StatusLock>,
}

impl StatusStore {
    /// Open for a backup run, taking the advisory lock
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock = StatusLock::acquire(&path)?;
        let mut store = Self::load(path)?;
        store._lock = Some(lock);
        if store.dead_lines > store.records.len() {
            store.compact()?;
        }
        Ok(store)
    }

    /// Read the status file without locking it
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (records, dead_lines) = read_records(&path)?;
        if dead_lines > 0 {
            debug!(
                "{}: {} superseded lines, {} live records",
                path.display(),
                dead_lines,
                records.len()
            );
        }
        Ok(StatusStore {
            path,
            records,
            pending: Vec::new(),
            dead_lines,
            _lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, local_path: &str) -> Option<&StatusRecord> {
        self.records.get(local_path)
    }

    /// All records, by local path
    pub fn records(&self) -> &BTreeMap<String, StatusRecord> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record; persisted by the next [`flush`](Self::flush)
    pub fn upsert(&mut self, record: StatusRecord) -> Result<()> {
        check_local_path(&record.local_path)?;
        if self
            .records
            .insert(record.local_path.clone(), record.clone())
            .is_some()
        {
            self.dead_lines += 1;
        }
        self.pending.push(record);
        Ok(())
    }

    /// Append pending records to the file
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        let mut buffer = String::new();
        let len = file.metadata()?.len();
        if len == 0 {
            buffer.push_str(HEADER);
            buffer.push('\n');
        } else if !ends_with_newline(&mut file, len)? {
            // close off a line torn by an earlier crash
            buffer.push('\n');
        }
        for record in &self.pending {
            buffer.push_str(&record.to_line());
        }
        file.write_all(buffer.as_bytes())?;
        file.sync_data()?;

        debug!("Flushed {} status records", self.pending.len());
        self.pending.clear();
        Ok(())
    }

    /// Rewrite the file with exactly one line per live record
    pub fn compact(&mut self) -> Result<()> {
        self.flush()?;
        let mut buffer = String::with_capacity(64 * (self.records.len() + 1));
        buffer.push_str(HEADER);
        buffer.push('\n');
        for record in self.records.values() {
            buffer.push_str(&record.to_line());
        }
        atomic_write(&self.path, buffer.as_bytes())?;
        self.dead_lines = 0;
        info!(
            "Compacted {} to {} records",
            self.path.display(),
            self.records.len()
        );
        Ok(())
    }
}

impl Drop for StatusStore {
    fn drop(&mut self) {
        if self._lock.is_some() && !self.pending.is_empty() {
            if let Err(e) = self.flush() {
                warn!("Could not flush status records: {}", e);
            }
        }
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Read all records, returning them with the number of superseded or
/// unreadable lines
fn read_records(path: &Path) -> Result<(BTreeMap<String, StatusRecord>, usize)> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((BTreeMap::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut records = BTreeMap::new();
    let mut dead_lines = 0usize;
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match StatusRecord::parse_line(line, path, i + 1) {
            Ok(record) => {
                if records.insert(record.local_path.clone(), record).is_some() {
                    dead_lines += 1;
                }
            }
            Err(e) => {
                // a torn append only costs a re-upload of that file
                warn!("Ignoring status line: {}", e);
                dead_lines += 1;
            }
        }
    }
    Ok((records, dead_lines))
}
