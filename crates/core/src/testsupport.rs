// SPDX-License-Identifier: MIT

//! Synthetic storage engine for tests
//!
//! Writes real segment files in the exact on-disk format the follower
//! reads: header blocks, log blocks with record framing, rotation,
//! checkpoint re-stamping, and optional encryption. Also emits archive
//! files the way the server-side archiver would.

use crate::block::{self, Lsn, BLOCK_HDR_SIZE, BLOCK_SIZE, BLOCK_TRL_SIZE};
use crate::encryption::RedoEncryption;
use crate::header::{self, HEADER_SIZE};
use crate::segment::segment_file_name;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const DATA_END: usize = BLOCK_SIZE - BLOCK_TRL_SIZE;

/// A storage engine stand-in appending records to a WAL directory.
pub struct SyntheticEngine {
    dir: PathBuf,
    segments: Vec<Lsn>,
    blocks_per_segment: u64,
    encryption: Option<RedoEncryption>,
    checkpoint_lsn: Lsn,
    checkpoint_no: u64,
    epoch: u32,
    /// Start LSN of the block currently being filled.
    cur_lsn: Lsn,
    /// In-block offset where the next data byte lands (header..data end).
    cur_fill: usize,
    cur_first_rec: usize,
    cur_data: [u8; BLOCK_SIZE],
}

impl SyntheticEngine {
    pub fn new(dir: impl Into<PathBuf>, start_lsn: Lsn) -> std::io::Result<Self> {
        Self::with_options(dir, start_lsn, 64, None)
    }

    pub fn with_options(
        dir: impl Into<PathBuf>,
        start_lsn: Lsn,
        blocks_per_segment: u64,
        encryption: Option<RedoEncryption>,
    ) -> std::io::Result<Self> {
        assert_eq!(start_lsn, block::align_down(start_lsn), "start lsn must be block-aligned");
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut engine = Self {
            dir,
            segments: Vec::new(),
            blocks_per_segment,
            encryption,
            checkpoint_lsn: start_lsn,
            checkpoint_no: 1,
            epoch: 1,
            cur_lsn: start_lsn,
            cur_fill: BLOCK_HDR_SIZE,
            cur_first_rec: 0,
            cur_data: [0u8; BLOCK_SIZE],
        };
        engine.create_segment(start_lsn)?;
        engine.flush_current()?;
        Ok(engine)
    }

    /// Stream position where the next data byte will land.
    pub fn lsn(&self) -> Lsn {
        self.cur_lsn + self.cur_fill as u64
    }

    pub fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint_lsn
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one framed record to the stream.
    pub fn append_record(&mut self, payload: &[u8]) -> std::io::Result<()> {
        assert!(!payload.is_empty() && payload.len() <= u16::MAX as usize);
        if self.cur_first_rec == 0 {
            self.cur_first_rec = self.cur_fill;
        }
        let mut bytes = Vec::with_capacity(2 + payload.len());
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(payload);

        for &b in &bytes {
            self.cur_data[self.cur_fill] = b;
            self.cur_fill += 1;
            if self.cur_fill == DATA_END {
                self.finish_block()?;
            }
        }
        self.flush_current()
    }

    /// Append records until the stream position reaches `target`.
    pub fn advance_to(&mut self, target: Lsn) -> std::io::Result<()> {
        let mut i = 0u64;
        while self.lsn() < target {
            let payload = format!("rec-{i}-{:08}", self.lsn());
            self.append_record(payload.as_bytes())?;
            i += 1;
        }
        Ok(())
    }

    /// Stamp a new checkpoint into every segment header.
    pub fn set_checkpoint(&mut self, lsn: Lsn) -> std::io::Result<()> {
        self.checkpoint_lsn = lsn;
        self.checkpoint_no += 1;
        for &start in &self.segments {
            let path = self.dir.join(segment_file_name(start));
            if !path.exists() {
                continue;
            }
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut hdr = vec![0u8; HEADER_SIZE];
            file.read_exact(&mut hdr)?;
            header::set_checkpoint(&mut hdr, lsn, self.checkpoint_no);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&hdr)?;
        }
        Ok(())
    }

    /// Bump the epoch, as a log-buffer flush after recovery would.
    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
    }

    /// Delete segment files that lie entirely below `lsn`, simulating the
    /// engine recycling old log.
    pub fn recycle_below(&mut self, lsn: Lsn) -> std::io::Result<()> {
        let keep_from = self
            .segments
            .iter()
            .rev()
            .find(|&&s| s <= lsn)
            .copied()
            .unwrap_or(0);
        let mut kept = Vec::new();
        for &start in &self.segments {
            if start < keep_from {
                std::fs::remove_file(self.dir.join(segment_file_name(start)))?;
            } else {
                kept.push(start);
            }
        }
        self.segments = kept;
        Ok(())
    }

    /// Overwrite the raw bytes of the block containing `lsn`; used to
    /// inject stale or mismatched blocks.
    pub fn write_raw_block(&mut self, lsn: Lsn, blk: &[u8; BLOCK_SIZE]) -> std::io::Result<()> {
        let aligned = block::align_down(lsn);
        let (start, path) = self.owning_segment(aligned)?;
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + (aligned - start)))?;
        file.write_all(blk)
    }

    /// Raw (possibly encrypted) on-disk bytes of the block containing `lsn`.
    pub fn read_raw_block(&self, lsn: Lsn) -> std::io::Result<[u8; BLOCK_SIZE]> {
        let aligned = block::align_down(lsn);
        let (start, path) = self.owning_segment(aligned)?;
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + (aligned - start)))?;
        let mut blk = [0u8; BLOCK_SIZE];
        file.read_exact(&mut blk)?;
        Ok(blk)
    }

    /// The raw stream bytes from block-aligned `from` up to `to`, as the
    /// follower should have copied them.
    pub fn stream_bytes(&self, from: Lsn, to: Lsn) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut lsn = block::align_down(from);
        while lsn < to {
            out.extend_from_slice(&self.read_raw_block(lsn)?);
            lsn += BLOCK_SIZE as u64;
        }
        Ok(out)
    }

    /// Build the contents of a server-side archive file whose first log
    /// block is the one containing `from`: one header block followed by
    /// raw log blocks. The archiver only ever emits sealed blocks, so the
    /// partially filled tail block is excluded.
    pub fn archive_bytes(&self, from: Lsn) -> std::io::Result<Vec<u8>> {
        let from = block::align_down(from);
        let mut out = vec![0u8; HEADER_SIZE];
        header::init(&mut out, from, "engine archiver");
        header::set_checkpoint(&mut out, self.checkpoint_lsn, self.checkpoint_no);

        let mut lsn = from;
        while lsn < self.cur_lsn {
            out.extend_from_slice(&self.read_raw_block(lsn)?);
            lsn += BLOCK_SIZE as u64;
        }
        Ok(out)
    }

    fn owning_segment(&self, aligned: Lsn) -> std::io::Result<(Lsn, PathBuf)> {
        let start = self
            .segments
            .iter()
            .rev()
            .find(|&&s| s <= aligned)
            .copied()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no segment owns lsn {aligned}"),
                )
            })?;
        Ok((start, self.dir.join(segment_file_name(start))))
    }

    fn create_segment(&mut self, start_lsn: Lsn) -> std::io::Result<()> {
        let path = self.dir.join(segment_file_name(start_lsn));
        let mut hdr = vec![0u8; HEADER_SIZE];
        header::init(&mut hdr, start_lsn, "engine");
        header::set_checkpoint(&mut hdr, self.checkpoint_lsn, self.checkpoint_no);
        std::fs::write(path, &hdr)?;
        self.segments.push(start_lsn);
        Ok(())
    }

    /// Seal the current block as full and move to the next one, rotating
    /// segments at capacity.
    fn finish_block(&mut self) -> std::io::Result<()> {
        self.write_block(BLOCK_SIZE)?;
        self.cur_lsn += BLOCK_SIZE as u64;
        self.cur_fill = BLOCK_HDR_SIZE;
        self.cur_first_rec = 0;
        self.cur_data = [0u8; BLOCK_SIZE];

        let segment_start = self.segments[self.segments.len() - 1];
        let blocks_in_segment = (self.cur_lsn - segment_start) / BLOCK_SIZE as u64;
        if blocks_in_segment >= self.blocks_per_segment {
            self.create_segment(self.cur_lsn)?;
        }
        Ok(())
    }

    /// (Re)write the current partially filled block.
    fn flush_current(&mut self) -> std::io::Result<()> {
        self.write_block(self.cur_fill)
    }

    fn write_block(&mut self, data_len: usize) -> std::io::Result<()> {
        let mut blk = self.cur_data;
        block::set_hdr_no(&mut blk, block::block_no_for_lsn(self.cur_lsn));
        block::set_data_len(&mut blk, data_len);
        block::set_first_rec(&mut blk, self.cur_first_rec);
        block::set_epoch(&mut blk, self.epoch);
        block::set_checksum(&mut blk);

        if let Some(encryption) = &self.encryption {
            if encryption.apply(&mut blk, self.cur_lsn).is_err() {
                return Err(std::io::Error::other("encryption failed"));
            }
        }

        let lsn = self.cur_lsn;
        self.write_raw_block(lsn, &blk)
    }
}

#[cfg(test)]
#[path = "testsupport_tests.rs"]
mod tests;
