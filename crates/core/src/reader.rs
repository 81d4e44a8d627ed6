// SPDX-License-Identifier: MIT

//! Live log segment reader
//!
//! Scans the engine's live WAL forward from the follower's contiguous LSN,
//! validating every block before it is handed downstream. The reader is the
//! component that decides whether a surprising block means "no more data
//! for now" (stale block, torn write, epoch leftover) or a fatal
//! consistency violation (block number ahead of expectation).

use crate::block::{self, Lsn, BLOCK_SIZE};
use crate::config::FollowerConfig;
use crate::encryption::EncryptionError;
use crate::error_flag::ErrorFlag;
use crate::header::{self, HeaderError, HEADER_SIZE};
use crate::segment::SegmentSet;
use crate::watermark::Watermarks;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// How many times a checkpoint read is retried while the engine keeps
/// re-stamping it.
const CHECKPOINT_READ_RETRIES: u32 = 100;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no WAL segments found in {0}")]
    NoSegments(PathBuf),
    #[error("log block mismatch at lsn {lsn}: expected block no {expected}, found {found}")]
    BlockMismatch { lsn: Lsn, expected: u32, found: u32 },
    #[error("checkpoint did not stabilize after {0} reads")]
    CheckpointUnstable(u32),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one [`LogReader::read_log`] pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Validated bytes available in the read buffer.
    pub len: usize,
    /// No more data for now; the caller should retry after the copy
    /// interval.
    pub finished: bool,
}

/// Reader over the live WAL segment set.
///
/// Not thread-safe by design: exactly one caller (the copy loop) drives it.
pub struct LogReader {
    segments: SegmentSet,
    config: FollowerConfig,
    buf: Vec<u8>,
    file_header: Vec<u8>,
    start_checkpoint_lsn: Lsn,
    scanned_lsn: Lsn,
    watermarks: Arc<Watermarks>,
    error_flag: ErrorFlag,
}

impl LogReader {
    pub fn new(config: FollowerConfig, watermarks: Arc<Watermarks>, error_flag: ErrorFlag) -> Self {
        let buf = vec![0u8; config.read_buffer_size];
        Self {
            segments: SegmentSet::new(&config.log_dir),
            config,
            buf,
            file_header: vec![0u8; HEADER_SIZE],
            start_checkpoint_lsn: 0,
            scanned_lsn: 0,
            watermarks,
            error_flag,
        }
    }

    /// Locate the starting checkpoint and seed the scan position from it.
    ///
    /// The engine re-stamps checkpoint fields while we read, so the scan is
    /// repeated until two passes agree on the checkpoint number.
    pub fn find_start_checkpoint(&mut self) -> Result<Lsn, ReadError> {
        self.segments.refresh()?;
        if self.segments.is_empty() {
            return Err(ReadError::NoSegments(self.segments.dir().to_path_buf()));
        }

        let (mut lsn, mut no) = self.read_max_checkpoint()?;
        let mut stable = false;
        for _ in 0..CHECKPOINT_READ_RETRIES {
            let (next_lsn, next_no) = self.read_max_checkpoint()?;
            if next_no == no {
                stable = true;
                break;
            }
            lsn = next_lsn;
            no = next_no;
        }
        if !stable {
            return Err(ReadError::CheckpointUnstable(CHECKPOINT_READ_RETRIES));
        }

        self.start_checkpoint_lsn = lsn;
        self.scanned_lsn = lsn;
        self.watermarks.scanned.advance_to(lsn);
        tracing::info!(checkpoint_lsn = lsn, checkpoint_no = no, "found start checkpoint");
        Ok(lsn)
    }

    /// Read every segment header and return the highest checkpoint seen,
    /// keeping a copy of the owning file header for the writer.
    fn read_max_checkpoint(&mut self) -> Result<(Lsn, u64), ReadError> {
        let mut best: Option<(Lsn, u64)> = None;
        let starts: Vec<Lsn> = self.segments.starts().collect();
        for start in starts {
            let Some(segment) = self.segments.locate(start) else {
                continue;
            };
            let mut file = File::open(&segment.path)?;
            let mut hdr = vec![0u8; HEADER_SIZE];
            if file.read_exact(&mut hdr).is_err() {
                // Freshly rotated-in segment, header not fully written yet
                continue;
            }
            if let Err(e) = header::validate(&hdr) {
                // Torn checkpoint stamp: skip this pass, the retry loop
                // will observe a settled header
                tracing::debug!(segment = %segment.path.display(), error = %e, "skipping unreadable segment header");
                continue;
            }
            let candidate = (header::checkpoint_lsn(&hdr), header::checkpoint_no(&hdr));
            if best.is_none() || candidate.1 > best.map(|b| b.1).unwrap_or(0) {
                best = Some(candidate);
                self.file_header.copy_from_slice(&hdr);
            }
        }
        best.ok_or_else(|| ReadError::NoSegments(self.segments.dir().to_path_buf()))
    }

    /// Read and validate log from the current contiguous LSN.
    ///
    /// Returns the number of bytes staged in [`buffer`](Self::buffer) that
    /// are safe to push downstream. `is_last` accepts a trailing partially
    /// filled block as final.
    pub fn read_log(&mut self, is_last: bool) -> Result<ReadOutcome, ReadError> {
        let chunk = self.config.scan_chunk_size;
        let mut start_lsn = block::align_down(self.scanned_lsn);
        let mut scanned = self.scanned_lsn;
        let mut len = 0usize;
        let mut finished = false;

        while !finished && len + chunk <= self.buf.len() {
            self.read_chunk(len, chunk, start_lsn)?;
            if let Some(encryption) = &self.config.encryption {
                encryption.remove(&mut self.buf[len..len + chunk], start_lsn)?;
            }
            let accepted = self.scan_chunk(len, chunk, is_last, start_lsn, &mut scanned, &mut finished)?;
            len += accepted;
            start_lsn += chunk as u64;
        }

        self.scanned_lsn = scanned;
        self.watermarks.scanned.advance_to(scanned);
        Ok(ReadOutcome { len, finished })
    }

    /// Reposition after another source (the archived log) supplied the
    /// bytes up to `lsn`.
    pub fn seek(&mut self, lsn: Lsn) {
        self.scanned_lsn = lsn;
        self.watermarks.scanned.advance_to(lsn);
    }

    /// Validated bytes staged by the last [`read_log`](Self::read_log).
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Header block of the segment file the start checkpoint was read from.
    pub fn header(&self) -> &[u8] {
        &self.file_header
    }

    pub fn scanned_lsn(&self) -> Lsn {
        self.scanned_lsn
    }

    pub fn contiguous_lsn(&self) -> Lsn {
        block::align_down(self.scanned_lsn)
    }

    pub fn start_checkpoint_lsn(&self) -> Lsn {
        self.start_checkpoint_lsn
    }

    pub fn is_error(&self) -> bool {
        self.error_flag.is_set()
    }

    /// Fill `buf[at..at + chunk]` with raw bytes starting at `start_lsn`,
    /// following the segment chain and zero-filling past the end of what is
    /// on disk (zero blocks fail validation and read as end-of-data).
    fn read_chunk(&mut self, at: usize, chunk: usize, start_lsn: Lsn) -> Result<(), ReadError> {
        let mut pos = 0usize;
        let mut lsn = start_lsn;
        let mut refreshed = false;

        while pos < chunk {
            let located = self.segments.locate(lsn);
            let available = match &located {
                Some(segment) => {
                    let offset = segment.offset_for(lsn);
                    let file_len = std::fs::metadata(&segment.path).map(|m| m.len()).unwrap_or(0);
                    file_len.saturating_sub(offset)
                }
                None => 0,
            };

            if available == 0 {
                // Either the LSN is not covered by the known set (rotation
                // may have happened) or the engine has not written this far
                // yet. Rescan the directory once before giving up.
                if !refreshed {
                    refreshed = true;
                    self.segments.refresh()?;
                    continue;
                }
                self.buf[at + pos..at + chunk].fill(0);
                return Ok(());
            }

            // located is Some here, otherwise available would be 0
            let Some(segment) = located else { continue };
            let want = (chunk - pos).min(available as usize);
            let mut file = File::open(&segment.path)?;
            file.seek(SeekFrom::Start(segment.offset_for(lsn)))?;
            let got = read_up_to(&mut file, &mut self.buf[at + pos..at + pos + want])?;
            if got == 0 {
                self.buf[at + pos..at + chunk].fill(0);
                return Ok(());
            }
            pos += got;
            lsn += got as u64;
        }
        Ok(())
    }

    /// Validate the blocks of one chunk, advancing `scanned` over accepted
    /// data. Returns the byte count safe to push downstream.
    fn scan_chunk(
        &mut self,
        at: usize,
        chunk: usize,
        is_last: bool,
        start_lsn: Lsn,
        scanned: &mut Lsn,
        finished: &mut bool,
    ) -> Result<usize, ReadError> {
        let mut lsn = start_lsn;
        let mut highest_epoch = 0u32;
        let mut off = 0usize;

        while off < chunk && !*finished {
            let blk = &self.buf[at + off..at + off + BLOCK_SIZE];
            let expected = block::block_no_for_lsn(lsn);
            let no = block::hdr_no(blk);
            let data_len = block::data_len(blk);

            if no == 0 && data_len == 0 {
                // Never-written space past the engine's write head
                *finished = true;
                break;
            }

            let checksum_ok = block::checksum_is_ok(blk);
            if no != expected && checksum_ok {
                if block::block_no_precedes(no, expected) {
                    // Previously seen block from an older pass over this
                    // part of the log
                    *finished = true;
                    break;
                }
                self.error_flag.set();
                tracing::error!(
                    expected,
                    found = no,
                    lsn,
                    "log block numbers mismatch; the log may have wrapped around before it could be copied"
                );
                return Err(ReadError::BlockMismatch { lsn, expected, found: no });
            }
            if !checksum_ok {
                tracing::warn!(
                    no,
                    lsn,
                    stored = block::checksum(blk),
                    calculated = block::calc_checksum(blk),
                    "log block checksum mismatch; block not fully written yet, will retry"
                );
                *finished = true;
                break;
            }

            let epoch = block::epoch(blk);
            if block::epoch_regressed(epoch, highest_epoch) {
                // Garbage left over from a log-buffer flush before the most
                // recent recovery
                *finished = true;
                break;
            }
            highest_epoch = highest_epoch.max(epoch);

            *scanned = lsn + data_len as u64;
            if data_len < BLOCK_SIZE {
                // Log data ends inside this block
                *finished = true;
            } else {
                lsn += BLOCK_SIZE as u64;
                off += BLOCK_SIZE;
            }
        }

        if !*finished {
            return Ok(chunk);
        }
        let mut accepted = block::align_up(*scanned).saturating_sub(start_lsn);
        if !is_last && *scanned % BLOCK_SIZE as u64 != 0 {
            // Hold the partially filled tail block back until the final pass
            accepted = accepted.saturating_sub(BLOCK_SIZE as u64);
        }
        Ok(accepted as usize)
    }
}

/// Read as many bytes as the file currently has, up to `buf.len()`.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
#[path = "reader_tests.rs"]
mod tests;
