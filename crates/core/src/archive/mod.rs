// SPDX-License-Identifier: MIT

//! Archived-log fallback
//!
//! The engine can be told to keep a second, server-managed copy of the WAL
//! in an archive directory. That copy outlives the live segment files, so
//! when the live log is recycled before the follower finishes, the archive
//! is the only remaining source of the missing bytes. This module holds the
//! background monitor that drives the archive lifecycle, the reader that
//! serves blocks out of the archive file, and the correlation state the
//! orchestrator steps through while splicing the archive in.

mod monitor;
mod reader;
mod state;

pub use monitor::{ArchiveMonitor, MonitorShared};
pub use reader::ArchiveReader;
pub use state::ArchiveState;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archived block checksum mismatch at lsn {0}")]
    BadBlock(crate::block::Lsn),
    #[error(transparent)]
    Encryption(#[from] crate::encryption::EncryptionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
