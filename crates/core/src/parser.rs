// SPDX-License-Identifier: MIT

//! Log stream parser
//!
//! Walks the same block boundaries as the reader but at the record level:
//! finds the first record boundary via the block header's first-record
//! offset, folds contiguous record bytes into a parse buffer, and advances
//! the durable-parsed LSN watermark as whole records decode. Collaborators
//! use that watermark to gate operations that are unsafe before a given
//! point in the log (for example interpreting a DDL-affecting record).

use crate::block::{self, Lsn, BLOCK_DATA_SIZE, BLOCK_HDR_SIZE, BLOCK_SIZE, BLOCK_TRL_SIZE};
use crate::watermark::Watermarks;
use std::sync::Arc;
use thiserror::Error;

/// Record framing: a 2-byte big-endian payload length.
pub const RECORD_HDR_SIZE: usize = 2;

/// A record spans at most one block boundary.
pub const MAX_RECORD_SIZE: usize = 2 * BLOCK_DATA_SIZE;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("corrupt record at lsn {lsn}: {reason}")]
    Corrupt { lsn: Lsn, reason: &'static str },
}

/// Record-level parser over validated block buffers.
///
/// Owned by the copy loop; only the parsed watermark is shared.
pub struct LogParser {
    /// LSN of the first record boundary, fixed once discovered.
    parse_start_lsn: Option<Lsn>,
    /// Stream position record decoding has reached.
    recovered_lsn: Lsn,
    /// Stream position up to which data bytes have been folded into `buf`.
    folded_lsn: Lsn,
    buf: Vec<u8>,
    /// Decoded prefix of `buf`.
    consumed: usize,
    records: u64,
    watermarks: Arc<Watermarks>,
}

impl LogParser {
    pub fn new(watermarks: Arc<Watermarks>) -> Self {
        Self {
            parse_start_lsn: None,
            recovered_lsn: 0,
            folded_lsn: 0,
            buf: Vec::new(),
            consumed: 0,
            records: 0,
            watermarks,
        }
    }

    /// Parse `len` bytes of validated blocks starting at block-aligned
    /// `start_lsn`.
    ///
    /// Bytes already folded into the parsed watermark are skipped, so
    /// re-feeding a partially filled block as it grows is safe.
    pub fn parse(&mut self, buf: &[u8], len: usize, start_lsn: Lsn) -> Result<(), ParseError> {
        debug_assert_eq!(start_lsn, block::align_down(start_lsn));

        let mut lsn = start_lsn;
        let mut off = 0usize;
        while off + BLOCK_SIZE <= len {
            let blk = &buf[off..off + BLOCK_SIZE];
            let data_len = block::data_len(blk);
            let first_rec = block::first_rec(blk);

            if self.parse_start_lsn.is_none() && first_rec > 0 {
                let start = lsn + first_rec as u64;
                self.parse_start_lsn = Some(start);
                self.recovered_lsn = start;
                self.folded_lsn = start;
                tracing::info!(lsn = start, "starting to parse log records");
            }

            if self.parse_start_lsn.is_some() {
                self.fold_block(blk, lsn, data_len);
            }

            if data_len < BLOCK_SIZE {
                // Log data ends inside this block
                break;
            }
            off += BLOCK_SIZE;
            lsn += BLOCK_SIZE as u64;
        }

        self.decode_records()?;
        self.maybe_compact();
        Ok(())
    }

    /// Highest LSN whose record boundaries have been fully decoded.
    pub fn parsed_lsn(&self) -> Lsn {
        self.watermarks.parsed.get()
    }

    pub fn parse_start_lsn(&self) -> Option<Lsn> {
        self.parse_start_lsn
    }

    /// Number of whole records decoded so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append the not-yet-folded part of a block's data region.
    fn fold_block(&mut self, blk: &[u8], lsn: Lsn, data_len: usize) {
        // A full block's data region ends before the trailer
        let data_end = data_len.min(BLOCK_SIZE - BLOCK_TRL_SIZE);
        if data_end <= BLOCK_HDR_SIZE {
            return;
        }
        let region_start = lsn + BLOCK_HDR_SIZE as u64;
        let region_end = lsn + data_end as u64;
        let from = self.folded_lsn.max(region_start);
        if from >= region_end {
            return;
        }
        let skip = (from - lsn) as usize;
        self.buf.extend_from_slice(&blk[skip..data_end]);
        self.folded_lsn = region_end;
    }

    /// Decode whole records off the folded buffer, advancing the parsed
    /// watermark by stream distance.
    fn decode_records(&mut self) -> Result<(), ParseError> {
        loop {
            let pending = &self.buf[self.consumed..];
            if pending.len() < RECORD_HDR_SIZE {
                break;
            }
            let rec_len = u16::from_be_bytes([pending[0], pending[1]]) as usize;
            if rec_len == 0 {
                return Err(ParseError::Corrupt {
                    lsn: self.recovered_lsn,
                    reason: "zero-length record",
                });
            }
            if RECORD_HDR_SIZE + rec_len > MAX_RECORD_SIZE {
                return Err(ParseError::Corrupt {
                    lsn: self.recovered_lsn,
                    reason: "record longer than one block boundary allows",
                });
            }
            if pending.len() < RECORD_HDR_SIZE + rec_len {
                break;
            }
            self.consumed += RECORD_HDR_SIZE + rec_len;
            self.records += 1;
            self.recovered_lsn =
                block::advance_lsn(self.recovered_lsn, (RECORD_HDR_SIZE + rec_len) as u64);
            self.watermarks.parsed.advance_to(self.recovered_lsn);
        }
        Ok(())
    }

    /// Move the undecoded tail to the front once the decoded prefix
    /// dominates the buffer.
    fn maybe_compact(&mut self) {
        if self.consumed > 0 && self.consumed * 4 > self.buf.len() {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
