//! Mapping store
//!
//! The authoritative index from local path to piece list. Each file is a
//! group:
//!
//! ```text
//! >> localPath \t pieceCount \t sha256 \t plainSize \t mtime \t algo
//! -- pieceIndex \t pieceName \t cipherSize
//! ...
//! ```
//!
//! Groups are separated by blank lines. Every change rewrites the whole file
//! atomically.

use super::{atomic_write, check_local_path, corrupt, parse_field, split_fields};
use crate::chunk::{validate_pieces, FileInfo, PieceName};
use crate::crypto::Algorithm;
use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const HEADER_PREFIX: &str = ">> ";
const PIECE_PREFIX: &str = "-- ";

/// Piece list of one file
pub type MappingEntry = Vec<FileInfo>;

/// Ordered local path to piece list index
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
    entries: BTreeMap<String, MappingEntry>,
}

impl MappingStore {
    /// Load the mapping file; a missing file is an empty mapping
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => parse(&text, &path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} mapping entries from {}", entries.len(), path.display());
        Ok(MappingStore { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, local_path: &str) -> Option<&[FileInfo]> {
        self.entries.get(local_path).map(Vec::as_slice)
    }

    pub fn contains(&self, local_path: &str) -> bool {
        self.entries.contains_key(local_path)
    }

    /// Entries in local path order
    pub fn items(&self) -> impl Iterator<Item = (&str, &[FileInfo])> {
        self.entries
            .iter()
            .map(|(path, pieces)| (path.as_str(), pieces.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the entry for `local_path` and persist
    ///
    /// The piece list must be complete; on any error the previous entry,
    /// in memory and on disk, is left untouched.
    pub fn set(&mut self, local_path: &str, pieces: MappingEntry) -> Result<()> {
        check_local_path(local_path)?;
        validate_pieces(&pieces)?;
        if pieces[0].local_path != local_path {
            return Err(crate::error::Error::Integrity(format!(
                "Pieces of {} offered for {}",
                pieces[0].local_path, local_path
            )));
        }

        let previous = self.entries.insert(local_path.to_string(), pieces);
        if let Err(e) = self.persist() {
            match previous {
                Some(previous) => self.entries.insert(local_path.to_string(), previous),
                None => self.entries.remove(local_path),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Drop the entry for `local_path` and persist
    pub fn remove(&mut self, local_path: &str) -> Result<Option<MappingEntry>> {
        let Some(removed) = self.entries.remove(local_path) else {
            return Ok(None);
        };
        if let Err(e) = self.persist() {
            self.entries.insert(local_path.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Replace every entry with those parsed from `text` and persist
    pub fn replace_all(&mut self, text: &str) -> Result<usize> {
        let entries = parse(text, &self.path)?;
        let previous = std::mem::replace(&mut self.entries, entries);
        if let Err(e) = self.persist() {
            self.entries = previous;
            return Err(e);
        }
        Ok(self.entries.len())
    }

    /// Text form of the whole mapping
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (i, (local_path, pieces)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let first = &pieces[0];
            out.push_str(&format!(
                "{}{}\t{}\t{}\t{}\t{}\t{}\n",
                HEADER_PREFIX,
                local_path,
                first.piece_count,
                first.sha256,
                first.plain_size,
                first.mtime,
                first.algorithm
            ));
            for piece in pieces {
                out.push_str(&format!(
                    "{}{}\t{}\t{}\n",
                    PIECE_PREFIX, piece.piece_index, piece.piece_name, piece.cipher_size
                ));
            }
        }
        out
    }

    fn persist(&self) -> Result<()> {
        atomic_write(&self.path, self.serialize().as_bytes())
    }
}

struct Header {
    local_path: String,
    piece_count: u32,
    sha256: String,
    plain_size: u64,
    mtime: i64,
    algorithm: Algorithm,
}

type OpenGroup = (Header, Vec<FileInfo>, usize);

fn close_group(
    group: Option<OpenGroup>,
    entries: &mut BTreeMap<String, MappingEntry>,
    file: &Path,
) -> Result<()> {
    let Some((header, pieces, line_no)) = group else {
        return Ok(());
    };
    if pieces.len() != header.piece_count as usize {
        return Err(corrupt(
            file,
            line_no,
            format!(
                "{} declares {} pieces but lists {}",
                header.local_path,
                header.piece_count,
                pieces.len()
            ),
        ));
    }
    validate_pieces(&pieces).map_err(|e| corrupt(file, line_no, e.to_string()))?;
    entries.insert(header.local_path, pieces);
    Ok(())
}

/// Parse mapping text; `file` is only used in error messages
pub fn parse(text: &str, file: &Path) -> Result<BTreeMap<String, MappingEntry>> {
    let mut entries = BTreeMap::new();
    let mut current: Option<OpenGroup> = None;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix(HEADER_PREFIX) {
            close_group(current.take(), &mut entries, file)?;
            let fields = split_fields(rest, 6, file, line_no)?;
            check_local_path(fields[0]).map_err(|e| corrupt(file, line_no, e.to_string()))?;
            let header = Header {
                local_path: fields[0].to_string(),
                piece_count: parse_field(fields[1], "piece count", file, line_no)?,
                sha256: fields[2].to_string(),
                plain_size: parse_field(fields[3], "size", file, line_no)?,
                mtime: parse_field(fields[4], "mtime", file, line_no)?,
                algorithm: fields[5]
                    .parse()
                    .map_err(|_| corrupt(file, line_no, "unknown algorithm"))?,
            };
            current = Some((header, Vec::new(), line_no));
        } else if let Some(rest) = line.strip_prefix(PIECE_PREFIX) {
            let Some((header, pieces, _)) = current.as_mut() else {
                return Err(corrupt(file, line_no, "piece line before any header"));
            };
            let fields = split_fields(rest, 3, file, line_no)?;
            pieces.push(FileInfo {
                local_path: header.local_path.clone(),
                piece_name: PieceName::from_raw(fields[1]),
                piece_index: parse_field(fields[0], "piece index", file, line_no)?,
                piece_count: header.piece_count,
                cipher_size: parse_field(fields[2], "cipher size", file, line_no)?,
                plain_size: header.plain_size,
                sha256: header.sha256.clone(),
                mtime: header.mtime,
                algorithm: header.algorithm,
            });
        } else {
            return Err(corrupt(file, line_no, "unrecognized line"));
        }
    }
    close_group(current.take(), &mut entries, file)?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    fn pieces(local_path: &str, count: u32, algorithm: Algorithm) -> MappingEntry {
        (0..count)
            .map(|i| FileInfo {
                local_path: local_path.to_string(),
                piece_name: PieceName::new("0badc0de", local_path, i),
                piece_index: i,
                piece_count: count,
                cipher_size: 2032,
                plain_size: 5000,
                sha256: "cd".repeat(32),
                mtime: 1_700_000_123,
                algorithm,
            })
            .collect()
    }

    #[test]
    fn test_set_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.txt");

        let mut store = MappingStore::load(&path).unwrap();
        assert!(store.is_empty());
        store.set("b.py", pieces("b.py", 3, Algorithm::Aes)).unwrap();
        store
            .set("a.py", pieces("a.py", 1, Algorithm::Fernet))
            .unwrap();

        let reloaded = MappingStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("b.py").unwrap(), store.get("b.py").unwrap());
        assert_eq!(reloaded.get("a.py").unwrap()[0].algorithm, Algorithm::Fernet);

        let order: Vec<&str> = reloaded.items().map(|(p, _)| p).collect();
        assert_eq!(order, vec!["a.py", "b.py"]);
    }

    #[test]
    fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.txt");
        let mut store = MappingStore::load(&path).unwrap();
        store.set("x.py", pieces("x.py", 2, Algorithm::Aes)).unwrap();
        store.set("y.py", pieces("y.py", 1, Algorithm::Aes)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with(">> x.py\t2\t"));
        assert!(lines[0].ends_with("\tAES"));
        assert!(lines[1].starts_with("-- 0\t0badc0de/"));
        assert!(lines[2].starts_with("-- 1\t"));
        assert_eq!(lines[3], "");
        assert!(lines[4].starts_with(">> y.py\t1\t"));
    }

    #[test]
    fn test_overwrite_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.txt");
        let mut store = MappingStore::load(&path).unwrap();

        store.set("b.py", pieces("b.py", 3, Algorithm::Aes)).unwrap();
        store.set("b.py", pieces("b.py", 2, Algorithm::Aes)).unwrap();
        assert_eq!(store.get("b.py").unwrap().len(), 2);

        assert!(store.remove("b.py").unwrap().is_some());
        assert!(store.remove("b.py").unwrap().is_none());
        assert!(MappingStore::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = MappingStore::load(dir.path().join("map.txt")).unwrap();
        store.set("b.py", pieces("b.py", 3, Algorithm::Aes)).unwrap();

        let mut partial = pieces("b.py", 3, Algorithm::Aes);
        partial.pop();
        assert!(store.set("b.py", partial).is_err());
        // previous entry intact
        assert_eq!(store.get("b.py").unwrap().len(), 3);
    }

    #[test]
    fn test_failed_persist_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        let mut store = MappingStore::load(blocker.join("map.txt")).unwrap();
        fs::write(&blocker, b"file, not a directory").unwrap();

        assert!(store.set("a.py", pieces("a.py", 1, Algorithm::Aes)).is_err());
        assert!(store.get("a.py").is_none());
    }

    #[test]
    fn test_parse_comments_and_errors() {
        let file = Path::new("map.txt");
        let text = "# written by hand\n>> a.py\t1\tff\t3\t9\tfernet\n-- 0\tname\t100\n";
        let entries = parse(text, file).unwrap();
        assert_eq!(entries["a.py"][0].piece_name.as_str(), "name");

        let short = ">> a.py\t2\tff\t3\t9\tAES\n-- 0\tname\t100\n";
        assert!(matches!(parse(short, file), Err(Error::Corrupt { .. })));

        let orphan = "-- 0\tname\t100\n";
        assert!(matches!(
            parse(orphan, file),
            Err(Error::Corrupt { line: 1, .. })
        ));

        let bad_algo = ">> a.py\t1\tff\t3\t9\tROT13\n-- 0\tname\t100\n";
        assert!(parse(bad_algo, file).is_err());
    }

    #[test]
    fn test_replace_all() {
        let dir = TempDir::new().unwrap();
        let mut source = MappingStore::load(dir.path().join("a.txt")).unwrap();
        source.set("a.py", pieces("a.py", 2, Algorithm::Aes)).unwrap();

        let mut target = MappingStore::load(dir.path().join("b.txt")).unwrap();
        target.set("old.py", pieces("old.py", 1, Algorithm::Aes)).unwrap();
        assert_eq!(target.replace_all(&source.serialize()).unwrap(), 1);
        assert!(target.get("old.py").is_none());
        assert_eq!(target.get("a.py").unwrap().len(), 2);
    }
}
