// SPDX-License-Identifier: MIT

//! Datasink seam
//!
//! The writer persists the copied log through this narrow interface. The
//! backup orchestration layer may hand in a sink that adds compression,
//! streaming, or at-rest encryption; this core only needs open/write/close.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink file already closed")]
    AlreadyClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open sink file.
pub trait SinkFile: Send + Sync + 'static {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError>;

    /// Flush and release the file. Required before drop; errors from close
    /// mean the output may be incomplete.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Factory for sink files.
pub trait Datasink: Send + Sync + 'static {
    type File: SinkFile;

    fn open(&self, name: &str) -> Result<Self::File, SinkError>;
}

/// Datasink writing plain files into a target directory.
#[derive(Clone, Debug)]
pub struct LocalSink {
    dir: PathBuf,
}

impl LocalSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Datasink for LocalSink {
    type File = LocalSinkFile;

    fn open(&self, name: &str) -> Result<LocalSinkFile, SinkError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(LocalSinkFile {
            path,
            file: Some(file),
        })
    }
}

/// A plain local file opened through [`LocalSink`].
#[derive(Debug)]
pub struct LocalSinkFile {
    path: PathBuf,
    file: Option<File>,
}

impl LocalSinkFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SinkFile for LocalSinkFile {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::AlreadyClosed)?;
        file.write_all(buf)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let mut file = self.file.take().ok_or(SinkError::AlreadyClosed)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}
