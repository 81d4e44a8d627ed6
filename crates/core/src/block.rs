// SPDX-License-Identifier: MIT

//! Log block framing
//!
//! The WAL is a logical stream of fixed 512-byte blocks. Each block carries
//! a 12-byte header (block number, data length, first-record offset, epoch),
//! up to 496 data bytes, and a trailing CRC32 over everything before the
//! trailer. LSNs are byte offsets into the logical stream and therefore
//! include the header/trailer overhead of every block they cross.

/// Log sequence number: a byte offset into the logical WAL stream.
pub type Lsn = u64;

/// Size of one log block, including header and trailer.
pub const BLOCK_SIZE: usize = 512;

/// Size of the block header.
pub const BLOCK_HDR_SIZE: usize = 12;

/// Size of the block trailer (CRC32).
pub const BLOCK_TRL_SIZE: usize = 4;

/// Data bytes a full block can carry.
pub const BLOCK_DATA_SIZE: usize = BLOCK_SIZE - BLOCK_HDR_SIZE - BLOCK_TRL_SIZE;

/// Block numbers wrap around at this mask.
pub const BLOCK_NO_MASK: u32 = 0x3FFF_FFFF;

// Header field offsets.
const HDR_NO: usize = 0;
const HDR_DATA_LEN: usize = 4;
const HDR_FIRST_REC: usize = 6;
const HDR_EPOCH: usize = 8;
const TRL_CHECKSUM: usize = BLOCK_SIZE - BLOCK_TRL_SIZE;

/// Block number a block starting at `lsn` must carry.
///
/// Zero is reserved for never-written blocks, hence the +1.
pub fn block_no_for_lsn(lsn: Lsn) -> u32 {
    (((lsn / BLOCK_SIZE as u64) as u32) & BLOCK_NO_MASK) + 1
}

/// Round an LSN down to the containing block boundary.
pub fn align_down(lsn: Lsn) -> Lsn {
    lsn - lsn % BLOCK_SIZE as u64
}

/// Round an LSN up to the next block boundary.
pub fn align_up(lsn: Lsn) -> Lsn {
    let rem = lsn % BLOCK_SIZE as u64;
    if rem == 0 {
        lsn
    } else {
        lsn + (BLOCK_SIZE as u64 - rem)
    }
}

/// Advance `lsn` by `data_len` stream data bytes, accounting for the
/// header/trailer overhead of every block boundary crossed.
///
/// `lsn` must point into a block's data region (or at a block start, which
/// is treated as the start of that block's data).
pub fn advance_lsn(lsn: Lsn, data_len: u64) -> Lsn {
    let frag = (lsn % BLOCK_SIZE as u64).saturating_sub(BLOCK_HDR_SIZE as u64);
    let crossings = (frag + data_len) / BLOCK_DATA_SIZE as u64;
    lsn + data_len + crossings * (BLOCK_HDR_SIZE + BLOCK_TRL_SIZE) as u64
}

/// Does block number `no` precede `expected`, modulo wrap-around?
///
/// Never-written blocks (no == 0) always count as preceding.
pub fn block_no_precedes(no: u32, expected: u32) -> bool {
    if no == 0 {
        return true;
    }
    let delta = expected.wrapping_sub(no) & BLOCK_NO_MASK;
    delta != 0 && delta < BLOCK_NO_MASK / 2
}

pub fn hdr_no(block: &[u8]) -> u32 {
    u32::from_be_bytes([block[HDR_NO], block[HDR_NO + 1], block[HDR_NO + 2], block[HDR_NO + 3]])
}

pub fn set_hdr_no(block: &mut [u8], no: u32) {
    block[HDR_NO..HDR_NO + 4].copy_from_slice(&no.to_be_bytes());
}

/// Data length counted from byte 0 of the block; a full block reports the
/// whole block size, an empty one reports the header size.
pub fn data_len(block: &[u8]) -> usize {
    u16::from_be_bytes([block[HDR_DATA_LEN], block[HDR_DATA_LEN + 1]]) as usize
}

pub fn set_data_len(block: &mut [u8], len: usize) {
    block[HDR_DATA_LEN..HDR_DATA_LEN + 2].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Offset from block start of the first record that begins in this block,
/// or 0 if no record begins here.
pub fn first_rec(block: &[u8]) -> usize {
    u16::from_be_bytes([block[HDR_FIRST_REC], block[HDR_FIRST_REC + 1]]) as usize
}

pub fn set_first_rec(block: &mut [u8], offset: usize) {
    block[HDR_FIRST_REC..HDR_FIRST_REC + 2].copy_from_slice(&(offset as u16).to_be_bytes());
}

pub fn epoch(block: &[u8]) -> u32 {
    u32::from_be_bytes([
        block[HDR_EPOCH],
        block[HDR_EPOCH + 1],
        block[HDR_EPOCH + 2],
        block[HDR_EPOCH + 3],
    ])
}

pub fn set_epoch(block: &mut [u8], epoch: u32) {
    block[HDR_EPOCH..HDR_EPOCH + 4].copy_from_slice(&epoch.to_be_bytes());
}

/// Stored trailer checksum.
pub fn checksum(block: &[u8]) -> u32 {
    u32::from_be_bytes([
        block[TRL_CHECKSUM],
        block[TRL_CHECKSUM + 1],
        block[TRL_CHECKSUM + 2],
        block[TRL_CHECKSUM + 3],
    ])
}

/// Checksum of the block contents (everything before the trailer).
pub fn calc_checksum(block: &[u8]) -> u32 {
    crc32fast::hash(&block[..TRL_CHECKSUM])
}

pub fn set_checksum(block: &mut [u8]) {
    let sum = calc_checksum(block);
    block[TRL_CHECKSUM..].copy_from_slice(&sum.to_be_bytes());
}

pub fn checksum_is_ok(block: &[u8]) -> bool {
    checksum(block) == calc_checksum(block)
}

/// Did the epoch regress far enough to indicate leftover garbage from a
/// previous log-buffer flush, rather than a legitimately older linked block?
pub fn epoch_regressed(block_epoch: u32, highest_seen: u32) -> bool {
    highest_seen > 0
        && block_epoch < highest_seen
        && highest_seen - block_epoch > 0x8000_0000
}

#[cfg(test)]
#[path = "block_tests.rs"]
mod tests;
