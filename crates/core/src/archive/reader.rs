// SPDX-License-Identifier: MIT

//! Archived log reader
//!
//! Serves whole blocks out of the server-written archive file. The file
//! starts with one non-log header block, so LSN-to-offset conversion is
//! relative to an explicitly set start LSN plus that fixed skip. Unlike the
//! live reader, every block read here must checksum cleanly: the archive is
//! written behind the engine's write head and never contains torn blocks.

use super::ArchiveError;
use crate::block::{self, Lsn, BLOCK_SIZE};
use crate::encryption::RedoEncryption;
use crate::header::HEADER_SIZE;
use crate::reader::ReadOutcome;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// Reader over the archived copy of the WAL.
pub struct ArchiveReader {
    file: File,
    buf: Vec<u8>,
    encryption: Option<RedoEncryption>,
    /// LSN of the first log block in the file (offset `HEADER_SIZE`).
    start_lsn: Lsn,
    scanned_lsn: Lsn,
}

impl ArchiveReader {
    pub fn new(file: File, read_buffer_size: usize, encryption: Option<RedoEncryption>) -> Self {
        let capacity = read_buffer_size - read_buffer_size % BLOCK_SIZE;
        Self {
            file,
            buf: vec![0u8; capacity],
            encryption,
            start_lsn: 0,
            scanned_lsn: 0,
        }
    }

    /// Fix the LSN of the archive's first log block.
    pub fn set_start_lsn(&mut self, lsn: Lsn) {
        debug_assert_eq!(lsn, block::align_down(lsn));
        self.start_lsn = lsn;
        self.scanned_lsn = lsn;
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Position the reader at `lsn` (rounded down to a block boundary).
    ///
    /// Returns false when the LSN precedes the archive's retained start or
    /// lies beyond what the server has archived so far.
    pub fn seek(&mut self, lsn: Lsn) -> bool {
        let aligned = block::align_down(lsn);
        if aligned < self.start_lsn {
            return false;
        }
        let pos = HEADER_SIZE as u64 + (aligned - self.start_lsn);
        let file_len = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        if file_len < pos {
            return false;
        }
        self.scanned_lsn = aligned;
        true
    }

    /// Read whole blocks from the current position, decrypt, and verify
    /// every checksum.
    pub fn read_log(&mut self) -> Result<ReadOutcome, ArchiveError> {
        let pos = HEADER_SIZE as u64 + (self.scanned_lsn - self.start_lsn);
        self.file.seek(SeekFrom::Start(pos))?;

        let mut total = 0usize;
        loop {
            match self.file.read(&mut self.buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if total == self.buf.len() {
                break;
            }
        }
        // Whole blocks only; the server appends in block units, so a
        // ragged tail is still being written
        let len = total - total % BLOCK_SIZE;
        let start_lsn = self.scanned_lsn;

        if let Some(encryption) = &self.encryption {
            encryption.remove(&mut self.buf[..len], start_lsn)?;
        }

        let mut lsn = start_lsn;
        for blk in self.buf[..len].chunks_exact(BLOCK_SIZE) {
            if !block::checksum_is_ok(blk) {
                return Err(ArchiveError::BadBlock(lsn));
            }
            lsn += BLOCK_SIZE as u64;
        }

        self.scanned_lsn += len as u64;
        Ok(ReadOutcome {
            len,
            finished: len < self.buf.len(),
        })
    }

    /// Scan forward from the first log block for a block corresponding to
    /// the live block at `live_lsn`; on success the archive's start LSN is
    /// derived from the match position.
    ///
    /// Correspondence is a heuristic, not a guaranteed-unique match: block
    /// numbers must be equal, and either the checksums agree or the data
    /// lengths differ (the trailing partially-filled block of the live
    /// stream may have grown by the time it was archived).
    pub fn scan_to_match(
        &mut self,
        live_lsn: Lsn,
        no: u32,
        checksum: u32,
        data_len: usize,
    ) -> Result<bool, ArchiveError> {
        self.file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut skipped = 0u64;
        loop {
            let mut blk = [0u8; BLOCK_SIZE];
            if !read_block(&mut self.file, &mut blk)? {
                return Ok(false);
            }
            let corresponds = block::hdr_no(&blk) == no
                && (block::checksum(&blk) == checksum || block::data_len(&blk) != data_len);
            if corresponds {
                self.set_start_lsn(live_lsn - skipped);
                tracing::info!(
                    start_lsn = self.start_lsn,
                    block_no = no,
                    "archived log caught up with the live stream"
                );
                return Ok(true);
            }
            skipped += BLOCK_SIZE as u64;
        }
    }

    /// Bytes staged by the last [`read_log`](Self::read_log).
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// End of the blocks read so far; always block-aligned.
    pub fn contiguous_lsn(&self) -> Lsn {
        self.scanned_lsn
    }
}

/// Read exactly one block, or report end-of-file if none is left whole.
fn read_block(file: &mut File, blk: &mut [u8; BLOCK_SIZE]) -> Result<bool, ArchiveError> {
    let mut total = 0usize;
    while total < BLOCK_SIZE {
        match file.read(&mut blk[total..]) {
            Ok(0) => return Ok(false),
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
#[path = "reader_tests.rs"]
mod tests;
