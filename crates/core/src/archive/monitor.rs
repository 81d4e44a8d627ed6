// SPDX-License-Identifier: MIT

//! Archived log monitor
//!
//! One background task per backup run: asks the engine to start archiving
//! the WAL into a private subdirectory, waits for the archive file to
//! appear, fingerprints its first log block, and hands a positioned
//! [`ArchiveReader`] to the copy loop. On stop it tells the engine to stop
//! archiving and removes the temporary archive.

use super::reader::ArchiveReader;
use crate::block::{self, BLOCK_SIZE};
use crate::config::FollowerConfig;
use crate::control::ControlPlane;
use crate::header::{self, HEADER_SIZE};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// State shared between the monitor task and the copy loop.
#[derive(Default)]
pub struct MonitorShared {
    stopped: AtomicBool,
    ready: AtomicBool,
    notify: Notify,
    first_block_no: AtomicU32,
    first_block_checksum: AtomicU32,
    first_block_data_len: AtomicU32,
    reader: Mutex<Option<ArchiveReader>>,
}

impl MonitorShared {
    /// Whether the archive file exists and its first block is readable.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn first_block_no(&self) -> u32 {
        self.first_block_no.load(Ordering::Acquire)
    }

    pub fn first_block_checksum(&self) -> u32 {
        self.first_block_checksum.load(Ordering::Acquire)
    }

    pub fn first_block_data_len(&self) -> usize {
        self.first_block_data_len.load(Ordering::Acquire) as usize
    }

    /// Take ownership of the archive reader. The copy loop calls this once
    /// after readiness; subsequent calls return None.
    pub fn take_reader(&self) -> Option<ArchiveReader> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleep one poll interval, returning early on a stop signal.
    async fn pause(&self, config: &FollowerConfig) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(config.archive_poll_interval) => {}
        }
    }
}

/// Handle to the background archive monitor.
pub struct ArchiveMonitor {
    shared: Arc<MonitorShared>,
    handle: Option<JoinHandle<()>>,
}

impl ArchiveMonitor {
    /// Spawn the monitor task.
    pub fn start<C: ControlPlane>(control: C, config: FollowerConfig) -> Self {
        let shared = Arc::new(MonitorShared::default());
        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            run(task_shared, control, config).await;
        });
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn shared(&self) -> Arc<MonitorShared> {
        Arc::clone(&self.shared)
    }

    /// Signal the task to stop and wait for it to clean up the archive.
    pub async fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "archive monitor task failed");
            }
        }
    }
}

async fn run<C: ControlPlane>(shared: Arc<MonitorShared>, control: C, config: FollowerConfig) {
    let dirs = match control.archive_dirs().await {
        Ok(dirs) if !dirs.is_empty() => dirs,
        Ok(_) => {
            tracing::info!("redo log archiving is not set up");
            return;
        }
        Err(e) => {
            tracing::info!(error = %e, "redo log archiving is not available");
            return;
        }
    };

    let server_uuid = match control.server_uuid().await {
        Ok(uuid) => uuid,
        Err(e) => {
            tracing::info!(error = %e, "cannot identify server; archiving not used");
            return;
        }
    };

    // Create a private subdirectory under the first usable archive dir
    let subdir = uuid::Uuid::new_v4().simple().to_string();
    let mut target: Option<(String, PathBuf)> = None;
    for dir in &dirs {
        let path = dir.path.join(&subdir);
        if std::fs::create_dir_all(&path).is_ok() {
            target = Some((dir.label.clone(), path));
            break;
        }
    }
    let Some((label, archive_dir)) = target else {
        tracing::info!("no archive directory is writable; archiving not used");
        return;
    };

    if let Err(e) = control.start_archiving(&label, &subdir).await {
        tracing::info!(error = %e, "redo log archiving is not used");
        let _ = std::fs::remove_dir(&archive_dir);
        return;
    }

    let archive_file = archive_dir.join(format!("archive.{server_uuid}.000001.log"));
    tracing::info!(file = %archive_file.display(), "waiting for archive file");

    // Wait for the server to create the file, then for the leading header
    // block plus the first log block to be fully written
    let want = (HEADER_SIZE + BLOCK_SIZE) as u64;
    while !shared.is_stopped() {
        let len = std::fs::metadata(&archive_file).map(|m| m.len()).unwrap_or(0);
        if len >= want {
            break;
        }
        shared.pause(&config).await;
    }

    if !shared.is_stopped() {
        match fingerprint(&archive_file, &config) {
            Ok((reader, no, checksum, data_len)) => {
                shared.first_block_no.store(no, Ordering::Release);
                shared.first_block_checksum.store(checksum, Ordering::Release);
                shared.first_block_data_len.store(data_len as u32, Ordering::Release);
                *shared.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);
                shared.ready.store(true, Ordering::Release);
                tracing::info!(
                    file = %archive_file.display(),
                    first_block_no = no,
                    first_block_checksum = checksum,
                    "archive file is ready"
                );
            }
            Err(e) => {
                tracing::warn!(file = %archive_file.display(), error = %e, "cannot read archive file");
            }
        }
    }

    // Park until the run ends
    while !shared.is_stopped() {
        shared.pause(&config).await;
    }

    if let Err(e) = control.stop_archiving().await {
        tracing::warn!(error = %e, "failed to stop redo log archiving");
    }
    let _ = std::fs::remove_file(&archive_file);
    let _ = std::fs::remove_dir(&archive_dir);
}

/// Open the archive, validate its leading header block, and fingerprint
/// the first log block.
fn fingerprint(
    path: &std::path::Path,
    config: &FollowerConfig,
) -> std::io::Result<(ArchiveReader, u32, u32, usize)> {
    let mut file = File::open(path)?;

    let mut hdr = vec![0u8; HEADER_SIZE];
    file.read_exact(&mut hdr)?;
    if let Err(e) = header::validate(&hdr) {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()));
    }

    let mut blk = vec![0u8; BLOCK_SIZE];
    file.read_exact(&mut blk)?;
    let no = block::hdr_no(&blk);
    let checksum = block::checksum(&blk);
    let data_len = block::data_len(&blk);

    file.seek(SeekFrom::Start(0))?;
    let reader = ArchiveReader::new(file, config.read_buffer_size, config.encryption.clone());
    Ok((reader, no, checksum, data_len))
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
