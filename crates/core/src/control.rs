// SPDX-License-Identifier: MIT

//! Control-plane seam
//!
//! The follower talks to the engine's SQL control plane through this trait:
//! checkpoint queries, the archive-on-server lifecycle, and WAL consumer
//! registration. Real implementations live in the backup orchestration
//! layer that owns connections and credentials; [`FakeControlPlane`] backs
//! the tests.

use crate::block::Lsn;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control-plane query failed: {0}")]
    QueryFailed(String),
    #[error("feature not supported by server: {0}")]
    Unsupported(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A labeled archive directory configured on the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveDir {
    pub label: String,
    pub path: PathBuf,
}

/// Engine control-plane operations consumed by the follower.
#[async_trait]
pub trait ControlPlane: Clone + Send + Sync + 'static {
    /// Server instance identifier, used in archive file names.
    async fn server_uuid(&self) -> Result<String, ControlError>;

    /// Current checkpoint LSN as reported by the engine.
    async fn checkpoint_lsn(&self) -> Result<Lsn, ControlError>;

    /// Directories the server is allowed to archive the WAL into.
    async fn archive_dirs(&self) -> Result<Vec<ArchiveDir>, ControlError>;

    /// Ask the server to start archiving the WAL under `label`/`subdir`.
    async fn start_archiving(&self, label: &str, subdir: &str) -> Result<(), ControlError>;

    /// Ask the server to stop archiving.
    async fn stop_archiving(&self) -> Result<(), ControlError>;

    /// Register as a WAL consumer: the engine must not purge log the
    /// follower has not read yet.
    async fn register_consumer(&self, name: &str) -> Result<(), ControlError>;

    /// Advance the registered consumer to `lsn`, releasing older log.
    async fn advance_consumer(&self, name: &str, lsn: Lsn) -> Result<(), ControlError>;

    /// Remove the consumer registration.
    async fn deregister_consumer(&self, name: &str) -> Result<(), ControlError>;
}

/// The follower's WAL consumer registration.
///
/// Registration failure at init is fatal; advance/deregister failures are
/// logged and the run continues (the worst case is the engine retaining
/// more log than necessary).
pub struct RedoLogConsumer<C: ControlPlane> {
    control: C,
    name: String,
    registered: bool,
}

impl<C: ControlPlane> RedoLogConsumer<C> {
    pub fn new(control: C, name: impl Into<String>) -> Self {
        Self {
            control,
            name: name.into(),
            registered: false,
        }
    }

    pub async fn register(&mut self) -> Result<(), ControlError> {
        self.control.register_consumer(&self.name).await?;
        self.registered = true;
        tracing::info!(consumer = %self.name, "registered as WAL consumer");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub async fn advance(&mut self, lsn: Lsn) {
        if !self.registered {
            return;
        }
        if let Err(e) = self.control.advance_consumer(&self.name, lsn).await {
            tracing::warn!(consumer = %self.name, lsn, error = %e, "failed to advance WAL consumer");
        }
    }

    pub async fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        match self.control.deregister_consumer(&self.name).await {
            Ok(()) => tracing::info!(consumer = %self.name, "deregistered WAL consumer"),
            Err(e) => {
                tracing::warn!(consumer = %self.name, error = %e, "failed to deregister WAL consumer");
            }
        }
    }
}

/// In-memory control plane for tests.
#[derive(Clone, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<FakeControlState>>,
}

#[derive(Default)]
struct FakeControlState {
    checkpoint_lsn: Lsn,
    archive_dirs: Vec<ArchiveDir>,
    /// Bytes the "server" writes into the archive file when archiving starts.
    archive_payload: Vec<u8>,
    archive_file: Option<PathBuf>,
    archive_stopped: bool,
    consumers: HashMap<String, Option<Lsn>>,
    /// Highest LSN ever advanced to, kept across deregistration.
    high_advance: Option<Lsn>,
    fail_register: bool,
    fail_advance: bool,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_checkpoint_lsn(&self, lsn: Lsn) {
        self.lock().checkpoint_lsn = lsn;
    }

    pub fn add_archive_dir(&self, label: impl Into<String>, path: impl Into<PathBuf>) {
        self.lock().archive_dirs.push(ArchiveDir {
            label: label.into(),
            path: path.into(),
        });
    }

    pub fn set_archive_payload(&self, bytes: Vec<u8>) {
        self.lock().archive_payload = bytes;
    }

    pub fn fail_register(&self) {
        self.lock().fail_register = true;
    }

    pub fn fail_advance(&self) {
        self.lock().fail_advance = true;
    }

    /// Path of the archive file written by the fake server, if archiving
    /// was started.
    pub fn archive_file(&self) -> Option<PathBuf> {
        self.lock().archive_file.clone()
    }

    pub fn archive_stopped(&self) -> bool {
        self.lock().archive_stopped
    }

    pub fn consumer_lsn(&self, name: &str) -> Option<Option<Lsn>> {
        self.lock().consumers.get(name).copied()
    }

    /// Highest LSN any consumer ever advanced to.
    pub fn high_advance(&self) -> Option<Lsn> {
        self.lock().high_advance
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn server_uuid(&self) -> Result<String, ControlError> {
        Ok("0000-fake-server".to_string())
    }

    async fn checkpoint_lsn(&self) -> Result<Lsn, ControlError> {
        Ok(self.lock().checkpoint_lsn)
    }

    async fn archive_dirs(&self) -> Result<Vec<ArchiveDir>, ControlError> {
        Ok(self.lock().archive_dirs.clone())
    }

    async fn start_archiving(&self, label: &str, subdir: &str) -> Result<(), ControlError> {
        let mut state = self.lock();
        let dir = state
            .archive_dirs
            .iter()
            .find(|d| d.label == label)
            .ok_or(ControlError::Unsupported("archive dir label"))?
            .path
            .clone();
        let file = dir.join(subdir).join("archive.0000-fake-server.000001.log");
        std::fs::write(&file, &state.archive_payload)?;
        state.archive_file = Some(file);
        Ok(())
    }

    async fn stop_archiving(&self) -> Result<(), ControlError> {
        self.lock().archive_stopped = true;
        Ok(())
    }

    async fn register_consumer(&self, name: &str) -> Result<(), ControlError> {
        let mut state = self.lock();
        if state.fail_register {
            return Err(ControlError::QueryFailed("register rejected".to_string()));
        }
        state.consumers.insert(name.to_string(), None);
        Ok(())
    }

    async fn advance_consumer(&self, name: &str, lsn: Lsn) -> Result<(), ControlError> {
        let mut state = self.lock();
        if state.fail_advance {
            return Err(ControlError::QueryFailed("advance rejected".to_string()));
        }
        let state = &mut *state;
        match state.consumers.get_mut(name) {
            Some(slot) => {
                *slot = Some(lsn);
                state.high_advance = state.high_advance.max(Some(lsn));
                Ok(())
            }
            None => Err(ControlError::QueryFailed(format!(
                "unknown consumer: {name}"
            ))),
        }
    }

    async fn deregister_consumer(&self, name: &str) -> Result<(), ControlError> {
        self.lock().consumers.remove(name);
        Ok(())
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
