//! File splitter
//!
//! Reads a plaintext file in windows of `threshold` bytes and encrypts each
//! window on its own. Only one window is held in memory at a time.

use super::{piece_count_for, PieceName, PlainDigest};
use crate::crypto::ChunkCodec;
use crate::error::{Error, Result};
use ring::digest::{Context, SHA256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// One encrypted window of a file, ready to upload
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub name: PieceName,
    /// Plaintext bytes covered by this piece
    pub plain_len: u64,
    /// Ciphertext blob
    pub data: Vec<u8>,
}

/// Splits files into encrypted pieces
#[derive(Debug, Clone, Copy)]
pub struct Splitter<'a> {
    codec: &'a ChunkCodec,
    threshold: u64,
}

impl<'a> Splitter<'a> {
    pub fn new(codec: &'a ChunkCodec, threshold: u64) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::Config("Threshold must be positive".to_string()));
        }
        Ok(Splitter { codec, threshold })
    }

    pub fn piece_count(&self, size: u64) -> Result<u32> {
        piece_count_for(size, self.threshold)
    }

    /// Start reading `path`, expecting the content described by `expected`
    ///
    /// The expectation is checked once the last piece has been produced: a
    /// file that changed while it was being split yields an integrity error
    /// instead of a silently inconsistent set of pieces.
    pub fn open(
        &self,
        path: &Path,
        local_path: &str,
        expected: &PlainDigest,
    ) -> Result<PieceReader<'a>> {
        let expected_count = self.piece_count(expected.size)?;
        let file = File::open(path)?;
        Ok(PieceReader {
            reader: BufReader::new(file),
            codec: self.codec,
            threshold: self.threshold,
            local_path: local_path.to_string(),
            expected: expected.clone(),
            expected_count,
            index: 0,
            plain_total: 0,
            hasher: Some(Context::new(&SHA256)),
            ended: false,
        })
    }
}

/// Pull-based iterator over the pieces of one file
pub struct PieceReader<'a> {
    reader: BufReader<File>,
    codec: &'a ChunkCodec,
    threshold: u64,
    local_path: String,
    expected: PlainDigest,
    expected_count: u32,
    index: u32,
    plain_total: u64,
    hasher: Option<Context>,
    ended: bool,
}

impl<'a> PieceReader<'a> {
    /// Number of pieces the file is expected to produce
    pub fn piece_count(&self) -> u32 {
        self.expected_count
    }

    /// Produce the next piece, or `None` after the last one
    pub fn next_piece(&mut self) -> Result<Option<Piece>> {
        if !self.ended {
            let capacity = self
                .threshold
                .min(self.expected.size.saturating_sub(self.plain_total))
                as usize;
            let mut window = Vec::with_capacity(capacity);
            (&mut self.reader)
                .take(self.threshold)
                .read_to_end(&mut window)?;

            let n = window.len() as u64;
            if n < self.threshold {
                self.ended = true;
            }

            // an empty file still gets its one piece
            if n > 0 || self.index == 0 {
                if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(&window);
                }
                let data = self.codec.encrypt(&window)?;
                let piece = Piece {
                    index: self.index,
                    name: PieceName::new(self.codec.fingerprint(), &self.local_path, self.index),
                    plain_len: n,
                    data,
                };
                self.index += 1;
                self.plain_total += n;
                return Ok(Some(piece));
            }
        }

        if let Some(hasher) = self.hasher.take() {
            self.verify(hex::encode(hasher.finish().as_ref()))?;
        }
        Ok(None)
    }

    fn verify(&self, sha256: String) -> Result<()> {
        if sha256 != self.expected.sha256
            || self.plain_total != self.expected.size
            || self.index != self.expected_count
        {
            return Err(Error::Integrity(format!(
                "{} changed while it was being read ({} bytes in {} pieces, expected {} bytes in {})",
                self.local_path, self.plain_total, self.index, self.expected.size, self.expected_count
            )));
        }
        Ok(())
    }
}
