// SPDX-License-Identifier: MIT

//! Log file header block
//!
//! Every segment file and the backup's output log file start with a single
//! header block: magic, format version, the LSN of the first log block in
//! the file, a creator tag, and the engine's current checkpoint fields.
//! The engine re-stamps the checkpoint fields in place while the file is
//! live, so checkpoint reads must be validated against torn writes.

use crate::block::{self, Lsn, BLOCK_SIZE};
use thiserror::Error;

/// Size of the file header (one block).
pub const HEADER_SIZE: usize = BLOCK_SIZE;

/// `b"HBWL"` — hotbak write-ahead log.
pub const HEADER_MAGIC: u32 = 0x4842_574C;

/// Current header format version.
pub const HEADER_FORMAT: u32 = 1;

/// Width of the creator tag field.
pub const CREATOR_SIZE: usize = 32;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 4;
const OFF_START_LSN: usize = 8;
const OFF_CREATOR: usize = 16;
const OFF_CHECKPOINT_LSN: usize = OFF_CREATOR + CREATOR_SIZE;
const OFF_CHECKPOINT_NO: usize = OFF_CHECKPOINT_LSN + 8;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("bad header magic: {0:#x}")]
    BadMagic(u32),
    #[error("unsupported header format: {0}")]
    UnsupportedFormat(u32),
    #[error("header checksum mismatch")]
    ChecksumMismatch,
    #[error("header truncated: {0} bytes")]
    Truncated(usize),
}

/// Validate magic, format, and checksum of a header block.
pub fn validate(buf: &[u8]) -> Result<(), HeaderError> {
    if buf.len() < HEADER_SIZE {
        return Err(HeaderError::Truncated(buf.len()));
    }
    let magic = read_u32(buf, OFF_MAGIC);
    if magic != HEADER_MAGIC {
        return Err(HeaderError::BadMagic(magic));
    }
    let format = read_u32(buf, OFF_FORMAT);
    if format != HEADER_FORMAT {
        return Err(HeaderError::UnsupportedFormat(format));
    }
    if !block::checksum_is_ok(&buf[..HEADER_SIZE]) {
        return Err(HeaderError::ChecksumMismatch);
    }
    Ok(())
}

/// Initialize a header block in place.
pub fn init(buf: &mut [u8], start_lsn: Lsn, creator: &str) {
    buf[..HEADER_SIZE].fill(0);
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&HEADER_MAGIC.to_be_bytes());
    buf[OFF_FORMAT..OFF_FORMAT + 4].copy_from_slice(&HEADER_FORMAT.to_be_bytes());
    buf[OFF_START_LSN..OFF_START_LSN + 8].copy_from_slice(&start_lsn.to_be_bytes());
    stamp_creator(buf, creator);
}

pub fn start_lsn(buf: &[u8]) -> Lsn {
    read_u64(buf, OFF_START_LSN)
}

pub fn checkpoint_lsn(buf: &[u8]) -> Lsn {
    read_u64(buf, OFF_CHECKPOINT_LSN)
}

pub fn checkpoint_no(buf: &[u8]) -> u64 {
    read_u64(buf, OFF_CHECKPOINT_NO)
}

pub fn set_checkpoint(buf: &mut [u8], lsn: Lsn, no: u64) {
    buf[OFF_CHECKPOINT_LSN..OFF_CHECKPOINT_LSN + 8].copy_from_slice(&lsn.to_be_bytes());
    buf[OFF_CHECKPOINT_NO..OFF_CHECKPOINT_NO + 8].copy_from_slice(&no.to_be_bytes());
    block::set_checksum(&mut buf[..HEADER_SIZE]);
}

/// Overwrite the creator tag and recompute the header checksum.
///
/// The tag is truncated or NUL-padded to the fixed field width.
pub fn stamp_creator(buf: &mut [u8], creator: &str) {
    let field = &mut buf[OFF_CREATOR..OFF_CREATOR + CREATOR_SIZE];
    field.fill(0);
    let bytes = creator.as_bytes();
    let n = bytes.len().min(CREATOR_SIZE);
    field[..n].copy_from_slice(&bytes[..n]);
    block::set_checksum(&mut buf[..HEADER_SIZE]);
}

pub fn creator(buf: &[u8]) -> String {
    let field = &buf[OFF_CREATOR..OFF_CREATOR + CREATOR_SIZE];
    let end = field.iter().position(|&b| b == 0).unwrap_or(CREATOR_SIZE);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}

#[cfg(test)]
#[path = "header_tests.rs"]
mod tests;
