// SPDX-License-Identifier: MIT

//! Follower configuration

use crate::block::BLOCK_SIZE;
use crate::encryption::RedoEncryption;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for one backup run's log follower.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FollowerConfig {
    /// Directory holding the engine's live WAL segment files.
    pub log_dir: PathBuf,
    /// How long the copy loop sleeps when no new WAL bytes are available.
    #[serde(with = "humantime_serde")]
    pub copy_interval: Duration,
    /// Poll interval of the archived-log monitor.
    #[serde(with = "humantime_serde")]
    pub archive_poll_interval: Duration,
    /// Size of the read buffer; must be a multiple of the scan chunk.
    pub read_buffer_size: usize,
    /// Bytes read and validated per scan step; must be a multiple of the
    /// block size.
    pub scan_chunk_size: usize,
    /// Name under which the follower registers as a WAL consumer, or None
    /// to skip consumer registration.
    pub consumer_name: Option<String>,
    /// WAL encryption metadata, when the engine encrypts its redo log.
    #[serde(skip)]
    pub encryption: Option<RedoEncryption>,
}

impl FollowerConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            copy_interval: Duration::from_secs(1),
            archive_poll_interval: Duration::from_millis(100),
            read_buffer_size: 1024 * 1024,
            scan_chunk_size: 64 * 1024,
            consumer_name: None,
            encryption: None,
        }
    }

    pub fn with_copy_interval(mut self, interval: Duration) -> Self {
        self.copy_interval = interval;
        self
    }

    pub fn with_archive_poll_interval(mut self, interval: Duration) -> Self {
        self.archive_poll_interval = interval;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_scan_chunk_size(mut self, size: usize) -> Self {
        self.scan_chunk_size = size;
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn with_encryption(mut self, encryption: RedoEncryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Validate size relationships the reader relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.scan_chunk_size == 0 || self.scan_chunk_size % BLOCK_SIZE != 0 {
            return Err(format!(
                "scan_chunk_size {} is not a positive multiple of the block size",
                self.scan_chunk_size
            ));
        }
        if self.read_buffer_size < self.scan_chunk_size
            || self.read_buffer_size % self.scan_chunk_size != 0
        {
            return Err(format!(
                "read_buffer_size {} is not a positive multiple of scan_chunk_size {}",
                self.read_buffer_size, self.scan_chunk_size
            ));
        }
        Ok(())
    }
}
