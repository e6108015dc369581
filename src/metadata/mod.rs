//! Metadata storage module
//!
//! Persists the two local indexes of a backup: the status file (per-file
//! outcomes used to skip unchanged files) and the mapping file (local path
//! to piece list). Both are line-oriented text.

mod lock;
mod mapping;
mod status;

pub use lock::StatusLock;
pub use mapping::{MappingEntry, MappingStore};
pub use status::{Outcome, StatusRecord, StatusStore};

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sibling temp path used while `path` is being replaced
pub fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::Internal(format!("No file name in {}", path.display())))?;
    let temp_name = format!(
        ".{}.tmp-{}",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    );
    Ok(path.with_file_name(temp_name))
}

/// Replace `path` with `data` so readers see either the old or the new
/// content, never a mix
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path_for(path)?;
    let result = (|| -> Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Split a tab-separated line into exactly `n` fields
pub(crate) fn split_fields<'a>(
    line: &'a str,
    n: usize,
    file: &Path,
    line_no: usize,
) -> Result<Vec<&'a str>> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != n {
        return Err(corrupt(
            file,
            line_no,
            format!("expected {} fields, found {}", n, fields.len()),
        ));
    }
    Ok(fields)
}

pub(crate) fn corrupt(file: &Path, line: usize, reason: impl Into<String>) -> Error {
    Error::Corrupt {
        file: file.display().to_string(),
        line,
        reason: reason.into(),
    }
}

/// Parse one numeric field, reporting the line on failure
pub(crate) fn parse_field<T: std::str::FromStr>(
    value: &str,
    what: &str,
    file: &Path,
    line_no: usize,
) -> Result<T> {
    value
        .parse()
        .map_err(|_| corrupt(file, line_no, format!("invalid {}: {:?}", what, value)))
}

/// Local paths are stored raw in tab-separated files
pub(crate) fn check_local_path(local_path: &str) -> Result<()> {
    if local_path.is_empty()
        || local_path.contains(['\t', '\n', '\r'])
        || local_path.split(['/', '\\']).any(|part| part == "..")
    {
        return Err(Error::Config(format!(
            "Local path cannot be stored: {:?}",
            local_path
        )));
    }
    Ok(())
}
