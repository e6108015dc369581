//! File joiner
//!
//! Feeds decrypted pieces, in index order, into a writer while hashing the
//! plaintext. The result is only accepted once the hash and size match the
//! mapping record.

use super::{validate_pieces, FileInfo};
use crate::crypto::ChunkCodec;
use crate::error::{Error, Result};
use ring::digest::{Context, SHA256};
use std::io::Write;

/// Reassembles one file from its pieces
pub struct Joiner<'a, W: Write> {
    codec: &'a ChunkCodec,
    pieces: &'a [FileInfo],
    out: W,
    hasher: Context,
    next: usize,
    written: u64,
}

impl<'a, W: Write> Joiner<'a, W> {
    /// Prepare to join `pieces`, which must be a complete mapping entry
    pub fn new(codec: &'a ChunkCodec, pieces: &'a [FileInfo], out: W) -> Result<Self> {
        validate_pieces(pieces)?;
        Ok(Joiner {
            codec,
            pieces,
            out,
            hasher: Context::new(&SHA256),
            next: 0,
            written: 0,
        })
    }

    /// The piece whose blob must be pushed next
    pub fn next_piece(&self) -> Option<&'a FileInfo> {
        self.pieces.get(self.next)
    }

    /// Decrypt and append the blob of the next piece
    pub fn push(&mut self, blob: &[u8]) -> Result<()> {
        let piece = self.next_piece().ok_or_else(|| {
            Error::Internal("All pieces have already been joined".to_string())
        })?;

        let plain = self
            .codec
            .decrypt(blob, Some(piece.algorithm))
            .map_err(|e| {
                Error::Integrity(format!(
                    "{} piece {}: {}",
                    piece.local_path, piece.piece_index, e
                ))
            })?;

        self.hasher.update(&plain);
        self.out.write_all(&plain)?;
        self.written += plain.len() as u64;
        self.next += 1;
        Ok(())
    }

    /// Verify the joined plaintext and hand back the writer
    pub fn finish(mut self) -> Result<W> {
        let first = &self.pieces[0];
        if self.next != self.pieces.len() {
            return Err(Error::Integrity(format!(
                "{}: only {} of {} pieces joined",
                first.local_path,
                self.next,
                self.pieces.len()
            )));
        }

        let sha256 = hex::encode(self.hasher.finish().as_ref());
        if sha256 != first.sha256 || self.written != first.plain_size {
            return Err(Error::Integrity(format!(
                "{}: hash mismatch (got {} / {} bytes, expected {} / {} bytes)",
                first.local_path, sha256, self.written, first.sha256, first.plain_size
            )));
        }

        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{hash_file, PieceName, Splitter};
    use crate::crypto::{Algorithm, BackupKey};
    use tempfile::NamedTempFile;

    fn codec() -> ChunkCodec {
        ChunkCodec::new(
            BackupKey::from_bytes(&b"unit".repeat(8)).unwrap(),
            Algorithm::Fernet,
        )
    }

    /// Split `content` and return the mapping records plus blobs
    fn backed_up(codec: &ChunkCodec, content: &[u8]) -> (Vec<FileInfo>, Vec<Vec<u8>>) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        let digest = hash_file(file.path()).unwrap();
        let splitter = Splitter::new(codec, 1000).unwrap();
        let mut reader = splitter.open(file.path(), "x/y.txt", &digest).unwrap();
        let count = reader.piece_count();

        let mut infos = Vec::new();
        let mut blobs = Vec::new();
        while let Some(piece) = reader.next_piece().unwrap() {
            infos.push(FileInfo {
                local_path: "x/y.txt".to_string(),
                piece_name: piece.name.clone(),
                piece_index: piece.index,
                piece_count: count,
                cipher_size: piece.data.len() as u64,
                plain_size: digest.size,
                sha256: digest.sha256.clone(),
                mtime: 0,
                algorithm: codec.algorithm(),
            });
            blobs.push(piece.data);
        }
        (infos, blobs)
    }

    #[test]
    fn test_join_roundtrip() {
        let codec = codec();
        let content = b"0123456789".repeat(250);
        let (infos, blobs) = backed_up(&codec, &content);
        assert_eq!(infos.len(), 3);

        let mut joiner = Joiner::new(&codec, &infos, Vec::new()).unwrap();
        for blob in &blobs {
            joiner.push(blob).unwrap();
        }
        assert!(joiner.next_piece().is_none());
        assert_eq!(joiner.finish().unwrap(), content);
    }

    #[test]
    fn test_out_of_order_blob_fails() {
        let codec = codec();
        let (infos, blobs) = backed_up(&codec, &b"abcdefghij".repeat(250));

        let mut joiner = Joiner::new(&codec, &infos, Vec::new()).unwrap();
        joiner.push(&blobs[1]).unwrap();
        joiner.push(&blobs[0]).unwrap();
        joiner.push(&blobs[2]).unwrap();
        assert!(matches!(joiner.finish(), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_incomplete_join_fails() {
        let codec = codec();
        let (infos, blobs) = backed_up(&codec, &[7u8; 1500]);

        let mut joiner = Joiner::new(&codec, &infos, Vec::new()).unwrap();
        joiner.push(&blobs[0]).unwrap();
        assert!(matches!(joiner.finish(), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_garbage_blob_is_integrity_error() {
        let codec = codec();
        let (infos, _) = backed_up(&codec, b"short");

        let mut joiner = Joiner::new(&codec, &infos, Vec::new()).unwrap();
        assert!(matches!(
            joiner.push(b"not a fernet token"),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_invalid_entry_rejected() {
        let codec = codec();
        let (mut infos, _) = backed_up(&codec, &[1u8; 2500]);
        infos[2].piece_name = PieceName::from_raw("elsewhere");
        infos.remove(1);
        assert!(Joiner::new(&codec, &infos, Vec::new()).is_err());
    }
}
