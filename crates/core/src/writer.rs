// SPDX-License-Identifier: MIT

//! Log stream writer
//!
//! Appends validated block buffers to the backup's own WAL file through the
//! datasink, re-encrypting in a reusable scratch buffer when the engine's
//! redo log is encrypted. The output framing is byte-identical to the
//! source WAL except for the creator tag and the checkpoint field stamped
//! into the header.

use crate::block::Lsn;
use crate::encryption::{EncryptionError, RedoEncryption};
use crate::header::{self, HEADER_SIZE};
use crate::sink::{Datasink, SinkError, SinkFile};
use std::time::SystemTime;
use thiserror::Error;

/// Creator tag stamped into the output header.
pub const CREATOR_TAG: &str = "hotbak";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("log writer is closed")]
    Closed,
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    Header(#[from] header::HeaderError),
}

/// Writer for the backup's output WAL file.
pub struct LogWriter<F: SinkFile> {
    name: String,
    file: Option<F>,
    scratch: Vec<u8>,
    encryption: Option<RedoEncryption>,
    bytes_written: u64,
}

impl<F: SinkFile> LogWriter<F> {
    /// Open the output file through the datasink.
    pub fn create<D: Datasink<File = F>>(
        sink: &D,
        name: &str,
        encryption: Option<RedoEncryption>,
    ) -> Result<Self, WriteError> {
        let file = sink.open(name)?;
        Ok(Self {
            name: name.to_string(),
            file: Some(file),
            scratch: Vec::new(),
            encryption,
            bytes_written: 0,
        })
    }

    /// Stamp the creator tag and the backup's checkpoint into a copy of the
    /// source header and write it out.
    pub fn write_header(&mut self, source_header: &[u8], checkpoint_lsn: Lsn) -> Result<(), WriteError> {
        header::validate(source_header)?;
        let mut hdr = source_header[..HEADER_SIZE].to_vec();
        let stamp = format!(
            "{CREATOR_TAG} {}",
            humantime::format_rfc3339_seconds(SystemTime::now())
        );
        header::set_checkpoint(&mut hdr, checkpoint_lsn, header::checkpoint_no(source_header));
        header::stamp_creator(&mut hdr, &stamp);

        let file = self.file.as_mut().ok_or(WriteError::Closed)?;
        file.write_all(&hdr)?;
        self.bytes_written += hdr.len() as u64;
        Ok(())
    }

    /// Append validated blocks starting at block-aligned `start_lsn`.
    ///
    /// The caller guarantees no concurrent writes; the scratch buffer is
    /// reused across calls.
    pub fn write(&mut self, buf: &[u8], start_lsn: Lsn) -> Result<(), WriteError> {
        let file = self.file.as_mut().ok_or(WriteError::Closed)?;
        match &self.encryption {
            Some(encryption) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(buf);
                encryption.apply(&mut self.scratch, start_lsn)?;
                file.write_all(&self.scratch)?;
            }
            None => file.write_all(buf)?,
        }
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Flush and release the output file.
    ///
    /// Failing to close before the run ends is a data-loss bug, not merely
    /// a descriptor leak.
    pub fn close(&mut self) -> Result<(), WriteError> {
        let mut file = self.file.take().ok_or(WriteError::Closed)?;
        file.close()?;
        tracing::info!(name = %self.name, bytes = self.bytes_written, "closed output log file");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl<F: SinkFile> Drop for LogWriter<F> {
    fn drop(&mut self) {
        if self.file.is_some() {
            tracing::error!(name = %self.name, "log writer dropped without close; output may be incomplete");
        }
    }
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
