// SPDX-License-Identifier: MIT

//! WAL encryption transform
//!
//! The engine encrypts only the data region of each log block; headers and
//! trailers stay in the clear and the trailer checksum covers the plaintext
//! contents. The transform must therefore be length-preserving and
//! random-access: AES-256-CTR with the keystream seeked to the block's
//! absolute stream offset, so any block can be encrypted or decrypted in
//! isolation.
//!
//! The key/IV pair is the engine's current WAL encryption metadata, fetched
//! by an out-of-scope credential layer and handed in at construction.

use crate::block::{self, Lsn, BLOCK_HDR_SIZE, BLOCK_SIZE, BLOCK_TRL_SIZE};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use thiserror::Error;
use zeroize::Zeroize;

type Aes256Ctr = Ctr128BE<Aes256>;

/// AES-256 key size.
pub const KEY_SIZE: usize = 32;

/// CTR IV size.
pub const IV_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("invalid key: must be exactly {KEY_SIZE} bytes")]
    InvalidKey,
    #[error("invalid iv: must be exactly {IV_SIZE} bytes")]
    InvalidIv,
    #[error("buffer length {0} is not a multiple of the block size")]
    UnalignedBuffer(usize),
}

/// The engine's WAL encryption metadata.
///
/// Read-only after construction; safe to share across collaborators. The
/// key material is zeroed from memory on drop.
#[derive(Clone)]
pub struct RedoEncryption {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl Drop for RedoEncryption {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for RedoEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoEncryption").finish_non_exhaustive()
    }
}

impl RedoEncryption {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, EncryptionError> {
        if key.len() != KEY_SIZE {
            return Err(EncryptionError::InvalidKey);
        }
        if iv.len() != IV_SIZE {
            return Err(EncryptionError::InvalidIv);
        }
        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key);
        let mut v = [0u8; IV_SIZE];
        v.copy_from_slice(iv);
        Ok(Self { key: k, iv: v })
    }

    /// Encrypt the data regions of whole blocks in place.
    ///
    /// `start_lsn` is the stream LSN of the first block in `buf` and must be
    /// block-aligned. CTR is an involution, so the same call decrypts.
    pub fn apply(&self, buf: &mut [u8], start_lsn: Lsn) -> Result<(), EncryptionError> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(EncryptionError::UnalignedBuffer(buf.len()));
        }
        debug_assert_eq!(start_lsn, block::align_down(start_lsn));

        let mut lsn = start_lsn;
        for blk in buf.chunks_exact_mut(BLOCK_SIZE) {
            let mut cipher = Aes256Ctr::new(&self.key.into(), &self.iv.into());
            cipher.seek(lsn + BLOCK_HDR_SIZE as u64);
            cipher.apply_keystream(&mut blk[BLOCK_HDR_SIZE..BLOCK_SIZE - BLOCK_TRL_SIZE]);
            lsn += BLOCK_SIZE as u64;
        }
        Ok(())
    }

    /// Alias for [`apply`](Self::apply); named for call sites that decrypt.
    pub fn remove(&self, buf: &mut [u8], start_lsn: Lsn) -> Result<(), EncryptionError> {
        self.apply(buf, start_lsn)
    }
}

#[cfg(test)]
#[path = "encryption_tests.rs"]
mod tests;
