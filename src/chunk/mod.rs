//! Chunk management module
//!
//! Handles splitting files into independently encrypted pieces, naming the
//! pieces on the sink, and joining them back.

mod joiner;
mod splitter;

pub use joiner::Joiner;
pub use splitter::{Piece, PieceReader, Splitter};

use crate::crypto::{sha1_hex, Algorithm};
use crate::error::{Error, Result};
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Buffer size for hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Remote name of one ciphertext blob
///
/// `{fingerprint}/{sha1(local_path)}.{index:04}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieceName(String);

impl PieceName {
    pub fn new(fingerprint: &str, local_path: &str, index: u32) -> Self {
        PieceName(format!(
            "{}/{}.{:04}",
            fingerprint,
            sha1_hex(local_path.as_bytes()),
            index
        ))
    }

    /// Wrap a name read back from a mapping file
    pub fn from_raw(name: impl Into<String>) -> Self {
        PieceName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PieceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PieceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of the encrypted mapping copy kept on the sink
pub fn mapping_blob_name(fingerprint: &str) -> String {
    format!("{}/__mapping__", fingerprint)
}

/// Descriptor of one uploaded piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Logical path of the file this piece belongs to
    pub local_path: String,
    pub piece_name: PieceName,
    /// 0-based position within the file
    pub piece_index: u32,
    pub piece_count: u32,
    /// Size of the blob on the sink
    pub cipher_size: u64,
    /// Size of the whole plaintext file
    pub plain_size: u64,
    /// Hex SHA-256 of the whole plaintext file
    pub sha256: String,
    pub mtime: i64,
    pub algorithm: Algorithm,
}

/// Hash and size of a plaintext file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainDigest {
    pub sha256: String,
    pub size: u64,
}

/// Stream a file through SHA-256
pub fn hash_file(path: &Path) -> Result<PlainDigest> {
    let mut file = File::open(path)?;
    let mut context = Context::new(&SHA256);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.update(&buffer[..n]);
        size += n as u64;
    }

    Ok(PlainDigest {
        sha256: hex::encode(context.finish().as_ref()),
        size,
    })
}

/// Number of pieces a file of `size` bytes splits into
///
/// An empty file still produces one (empty) piece. Piece indices are `u32`,
/// so a threshold that would need more pieces than that is rejected.
pub fn piece_count_for(size: u64, threshold: u64) -> Result<u32> {
    if size == 0 || threshold == 0 {
        return Ok(1);
    }
    u32::try_from(size.div_ceil(threshold)).map_err(|_| {
        Error::Config(format!(
            "{} bytes at {} bytes per piece exceeds {} pieces",
            size,
            threshold,
            u32::MAX
        ))
    })
}

/// Check that a piece list forms one complete, consistent file
pub fn validate_pieces(pieces: &[FileInfo]) -> Result<()> {
    let first = pieces
        .first()
        .ok_or_else(|| Error::Integrity("Mapping entry has no pieces".to_string()))?;

    if first.piece_count as usize != pieces.len() {
        return Err(Error::Integrity(format!(
            "{}: piece count {} but {} pieces listed",
            first.local_path,
            first.piece_count,
            pieces.len()
        )));
    }

    for (expected, piece) in pieces.iter().enumerate() {
        if piece.piece_index as usize != expected {
            return Err(Error::Integrity(format!(
                "{}: piece {} found at position {}",
                first.local_path, piece.piece_index, expected
            )));
        }
        if piece.piece_count != first.piece_count
            || piece.sha256 != first.sha256
            || piece.plain_size != first.plain_size
            || piece.mtime != first.mtime
            || piece.algorithm != first.algorithm
            || piece.local_path != first.local_path
        {
            return Err(Error::Integrity(format!(
                "{}: piece {} disagrees with piece 0",
                first.local_path, piece.piece_index
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_pieces(count: u32) -> Vec<FileInfo> {
        (0..count)
            .map(|i| FileInfo {
                local_path: "dir/b.py".to_string(),
                piece_name: PieceName::new("0badc0de", "dir/b.py", i),
                piece_index: i,
                piece_count: count,
                cipher_size: 2016,
                plain_size: 5000,
                sha256: "ab".repeat(32),
                mtime: 1_700_000_000,
                algorithm: Algorithm::Aes,
            })
            .collect()
    }

    #[test]
    fn test_piece_name_layout() {
        let name = PieceName::new("0badc0de", "abc", 7);
        assert_eq!(
            name.as_str(),
            "0badc0de/a9993e364706816aba3e25717850c26c9cd0d89d.0007"
        );
    }

    #[test]
    fn test_piece_name_depends_on_fingerprint() {
        assert_ne!(
            PieceName::new("aaaaaaaa", "a.py", 0),
            PieceName::new("bbbbbbbb", "a.py", 0)
        );
    }

    #[test]
    fn test_piece_count_boundaries() {
        assert_eq!(piece_count_for(0, 2000).unwrap(), 1);
        assert_eq!(piece_count_for(1, 2000).unwrap(), 1);
        assert_eq!(piece_count_for(2000, 2000).unwrap(), 1);
        assert_eq!(piece_count_for(2001, 2000).unwrap(), 2);
        assert_eq!(piece_count_for(5000, 2000).unwrap(), 3);
    }

    #[test]
    fn test_piece_count_overflow_rejected() {
        assert_eq!(piece_count_for(u32::MAX as u64, 1).unwrap(), u32::MAX);
        assert!(matches!(
            piece_count_for(u32::MAX as u64 + 1, 1),
            Err(Error::Config(_))
        ));
        assert!(piece_count_for(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_validate_pieces() {
        assert!(validate_pieces(&sample_pieces(3)).is_ok());
        assert!(validate_pieces(&[]).is_err());

        let mut missing = sample_pieces(3);
        missing.remove(1);
        assert!(validate_pieces(&missing).is_err());

        let mut swapped = sample_pieces(3);
        swapped.swap(0, 2);
        assert!(validate_pieces(&swapped).is_err());

        let mut mixed = sample_pieces(2);
        mixed[1].sha256 = "cd".repeat(32);
        assert!(validate_pieces(&mixed).is_err());
    }

    #[test]
    fn test_hash_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        let digest = hash_file(file.path()).unwrap();
        assert_eq!(digest.size, 3);
        assert_eq!(
            digest.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_mapping_blob_name() {
        assert_eq!(mapping_blob_name("0badc0de"), "0badc0de/__mapping__");
    }
}
