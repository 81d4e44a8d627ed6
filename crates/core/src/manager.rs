// SPDX-License-Identifier: MIT

//! Continuous-copy orchestrator
//!
//! Owns the backup run's background copy task: each iteration reads a batch
//! of validated log (preferring the archived copy once it is positioned),
//! parses it, and appends it to the backup's output log. Exposes the
//! start/stop-at/abort lifecycle and the LSN accessors collaborators gate
//! on. The reader, parser, and writer are owned by the copy task and never
//! shared; only watermarks, the stop/abort signals, and the error flag
//! cross task boundaries.

use crate::archive::{ArchiveError, ArchiveMonitor, ArchiveReader, ArchiveState, MonitorShared};
use crate::block::{self, Lsn, BLOCK_SIZE};
use crate::config::FollowerConfig;
use crate::control::{ControlError, ControlPlane, RedoLogConsumer};
use crate::error_flag::ErrorFlag;
use crate::parser::{LogParser, ParseError};
use crate::reader::{LogReader, ReadError};
use crate::sink::{Datasink, SinkFile};
use crate::watermark::Watermarks;
use crate::writer::{LogWriter, WriteError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Output file name of the copied log.
pub const OUTPUT_LOG_NAME: &str = "hotbak_logfile";

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("invalid follower configuration: {0}")]
    Config(String),
    #[error("log follower is not initialized")]
    NotInitialized,
    #[error("log follower is not running")]
    NotRunning,
    #[error("copy task failed: {0}")]
    TaskFailed(String),
    #[error("checkpoint lsn {checkpoint} is beyond the last copied lsn {scanned}")]
    CheckpointBeyondScanned { checkpoint: Lsn, scanned: Lsn },
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// What the copy task reports back when it exits.
#[derive(Debug)]
pub struct CopyOutcome {
    pub scanned_lsn: Lsn,
    pub error: Option<CopyError>,
}

/// Orchestrator for one backup run's log following.
pub struct LogCopyManager<C: ControlPlane, D: Datasink> {
    config: FollowerConfig,
    control: Option<C>,
    watermarks: Arc<Watermarks>,
    error_flag: ErrorFlag,
    stop_lsn: Arc<AtomicU64>,
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
    start_checkpoint_lsn: Lsn,
    last_checkpoint_lsn: Lsn,
    monitor: Option<ArchiveMonitor>,
    copy_loop: Option<CopyLoop<C, D::File>>,
    task: Option<JoinHandle<CopyOutcome>>,
}

impl<C: ControlPlane, D: Datasink> LogCopyManager<C, D> {
    pub fn new(config: FollowerConfig, control: Option<C>) -> Self {
        Self {
            config,
            control,
            watermarks: Arc::new(Watermarks::new()),
            error_flag: ErrorFlag::new(),
            stop_lsn: Arc::new(AtomicU64::new(0)),
            aborted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            start_checkpoint_lsn: 0,
            last_checkpoint_lsn: 0,
            monitor: None,
            copy_loop: None,
            task: None,
        }
    }

    /// Locate the start checkpoint, open the output file, write its header,
    /// register as a WAL consumer, and start the archive monitor.
    ///
    /// Consumer registration failure here is fatal: without it the engine
    /// may purge log the follower still needs.
    pub async fn init(&mut self, sink: &D) -> Result<(), CopyError> {
        self.config.validate().map_err(CopyError::Config)?;

        let mut reader = LogReader::new(
            self.config.clone(),
            Arc::clone(&self.watermarks),
            self.error_flag.clone(),
        );
        self.start_checkpoint_lsn = reader.find_start_checkpoint()?;
        self.last_checkpoint_lsn = self.start_checkpoint_lsn;

        let mut writer = LogWriter::create(sink, OUTPUT_LOG_NAME, self.config.encryption.clone())?;
        writer.write_header(reader.header(), self.start_checkpoint_lsn)?;

        let mut consumer = None;
        if let (Some(control), Some(name)) = (&self.control, &self.config.consumer_name) {
            let mut c = RedoLogConsumer::new(control.clone(), name.clone());
            if let Err(e) = c.register().await {
                let _ = writer.close();
                return Err(e.into());
            }
            consumer = Some(c);
        }

        let monitor_shared = self.control.as_ref().map(|control| {
            let monitor = ArchiveMonitor::start(control.clone(), self.config.clone());
            let shared = monitor.shared();
            self.monitor = Some(monitor);
            shared
        });

        self.copy_loop = Some(CopyLoop {
            reader,
            parser: LogParser::new(Arc::clone(&self.watermarks)),
            writer,
            consumer,
            monitor_shared,
            archive_reader: None,
            archive_state: ArchiveState::None,
            error_flag: self.error_flag.clone(),
            stop_lsn: Arc::clone(&self.stop_lsn),
            aborted: Arc::clone(&self.aborted),
            notify: Arc::clone(&self.notify),
            copy_interval: self.config.copy_interval,
        });
        Ok(())
    }

    /// Run one synchronous priming drain, anchoring the backup's point in
    /// time before data-file copying proceeds, then launch the background
    /// loop.
    pub async fn start(&mut self) -> Result<(), CopyError> {
        let mut copy_loop = self.copy_loop.take().ok_or(CopyError::NotInitialized)?;

        loop {
            match copy_loop.copy_once(false) {
                Ok(true) => break,
                Ok(false) => copy_loop.sync_consumer().await,
                Err(e) => {
                    self.error_flag.set();
                    let _ = copy_loop.writer.close();
                    return Err(e);
                }
            }
        }
        copy_loop.sync_consumer().await;
        tracing::info!(lsn = copy_loop.reader.scanned_lsn(), "log follower primed");

        self.task = Some(tokio::spawn(copy_loop.run()));
        Ok(())
    }

    /// Record the stop target, drain the loop, and validate the run against
    /// the engine's final checkpoint.
    ///
    /// Fails iff the achieved scanned LSN is below `checkpoint_lsn`; the
    /// backup cannot be made consistent in that case.
    pub async fn stop_at(&mut self, lsn: Lsn, checkpoint_lsn: Lsn) -> Result<(), CopyError> {
        tracing::info!(stop_lsn = lsn, checkpoint_lsn, "stopping log copying");
        self.last_checkpoint_lsn = checkpoint_lsn;
        self.stop_lsn.store(lsn, Ordering::Release);
        self.notify.notify_waiters();

        let outcome = self.join_task().await?;
        self.stop_monitor().await;

        if let Some(error) = outcome.error {
            return Err(error);
        }
        if outcome.scanned_lsn < checkpoint_lsn {
            self.error_flag.set();
            return Err(CopyError::CheckpointBeyondScanned {
                checkpoint: checkpoint_lsn,
                scanned: outcome.scanned_lsn,
            });
        }
        Ok(())
    }

    /// Request immediate stop without an LSN target; used only on
    /// unrecoverable error.
    pub async fn abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
        self.notify.notify_waiters();
        if self.task.is_some() {
            if let Err(e) = self.join_task().await {
                tracing::warn!(error = %e, "copy task did not shut down cleanly");
            }
        }
        // Aborting between init and start: the output still must be closed
        if let Some(mut copy_loop) = self.copy_loop.take() {
            let _ = copy_loop.writer.close();
        }
        self.stop_monitor().await;
    }

    pub fn scanned_lsn(&self) -> Lsn {
        self.watermarks.scanned.get()
    }

    pub fn parsed_lsn(&self) -> Lsn {
        self.watermarks.parsed.get()
    }

    pub fn stop_lsn(&self) -> Lsn {
        self.stop_lsn.load(Ordering::Acquire)
    }

    pub fn start_checkpoint_lsn(&self) -> Lsn {
        self.start_checkpoint_lsn
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn
    }

    pub fn copy_interval(&self) -> std::time::Duration {
        self.config.copy_interval
    }

    pub fn is_error(&self) -> bool {
        self.error_flag.is_set()
    }

    /// Whether record parsing has safely covered `lsn`.
    ///
    /// True when the watermark has reached it, when no records have been
    /// parsed at all yet, or when the distance is less than one block
    /// (records never straddle more than one unparsed block).
    pub fn has_parsed_lsn(&self, lsn: Lsn) -> bool {
        let parsed = self.watermarks.parsed.get();
        parsed >= lsn || parsed == 0 || lsn - parsed < BLOCK_SIZE as u64
    }

    async fn join_task(&mut self) -> Result<CopyOutcome, CopyError> {
        let task = self.task.take().ok_or(CopyError::NotRunning)?;
        match task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.error_flag.set();
                Err(CopyError::TaskFailed(e.to_string()))
            }
        }
    }

    async fn stop_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }
}

/// The state owned by the background copy task.
struct CopyLoop<C: ControlPlane, F: SinkFile> {
    reader: LogReader,
    parser: LogParser,
    writer: LogWriter<F>,
    consumer: Option<RedoLogConsumer<C>>,
    monitor_shared: Option<Arc<MonitorShared>>,
    archive_reader: Option<ArchiveReader>,
    archive_state: ArchiveState,
    error_flag: ErrorFlag,
    stop_lsn: Arc<AtomicU64>,
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
    copy_interval: std::time::Duration,
}

impl<C: ControlPlane, F: SinkFile> CopyLoop<C, F> {
    async fn run(mut self) -> CopyOutcome {
        let mut error: Option<CopyError> = None;

        while error.is_none()
            && !self.is_aborted()
            && !self.error_flag.is_set()
            && (self.stop_target() == 0 || self.stop_target() > self.reader.scanned_lsn())
        {
            match self.copy_once(false) {
                Ok(finished) => {
                    self.sync_consumer().await;
                    if finished {
                        tracing::info!(lsn = self.reader.scanned_lsn(), "log scanned up to");
                        self.wait_for_work().await;
                    }
                }
                Err(e) => {
                    self.error_flag.set();
                    error = Some(e);
                }
            }
        }

        // One final non-blocking pass accepting the partial tail block
        if error.is_none() && !self.is_aborted() && !self.error_flag.is_set() {
            match self.copy_once(true) {
                Ok(_) => self.sync_consumer().await,
                Err(e) => {
                    self.error_flag.set();
                    error = Some(e);
                }
            }
        }

        // The output must be closed on every exit path, error included
        if !self.writer.is_closed() {
            if let Err(e) = self.writer.close() {
                self.error_flag.set();
                if error.is_none() {
                    error = Some(e.into());
                }
            }
        }
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.deregister().await;
        }

        CopyOutcome {
            scanned_lsn: self.reader.scanned_lsn(),
            error,
        }
    }

    /// Copy one batch: prefer the positioned archive, fall back to the live
    /// log. Returns whether the source is drained for now.
    fn copy_once(&mut self, is_last: bool) -> Result<bool, CopyError> {
        let start_lsn = self.reader.contiguous_lsn();

        if self.archive_state.is_positioned() {
            if let Some(archive) = self.archive_reader.as_mut() {
                if archive.seek(start_lsn) {
                    let outcome = archive.read_log()?;
                    if outcome.len > 0 {
                        let end = archive.contiguous_lsn();
                        let buf = archive.buffer();
                        self.parser.parse(buf, outcome.len, start_lsn)?;
                        self.writer.write(&buf[..outcome.len], start_lsn)?;
                        self.reader.seek(end);
                        return Ok(outcome.finished);
                    }
                    let target = self.stop_lsn.load(Ordering::Acquire);
                    if target == 0 || archive.contiguous_lsn() >= target {
                        return Ok(true);
                    }
                    // The archive lags the stop target: drain the rest live
                } else {
                    tracing::warn!(
                        lsn = start_lsn,
                        "archive seek failed; falling back to the live log"
                    );
                }
            }
        }

        let outcome = self.reader.read_log(is_last)?;
        if outcome.len == 0 {
            return Ok(outcome.finished);
        }
        self.track_archived_log(start_lsn, outcome.len)?;

        let buf = self.reader.buffer();
        self.parser.parse(buf, outcome.len, start_lsn)?;
        self.writer.write(&buf[..outcome.len], start_lsn)?;
        Ok(outcome.finished)
    }

    /// Correlate the just-read live blocks with the archived copy,
    /// stepping the archive state machine forward.
    fn track_archived_log(&mut self, start_lsn: Lsn, len: usize) -> Result<(), CopyError> {
        let Self {
            monitor_shared,
            archive_reader,
            archive_state,
            reader,
            ..
        } = self;
        let Some(shared) = monitor_shared else {
            return Ok(());
        };
        if !shared.is_ready() || archive_state.is_positioned() {
            return Ok(());
        }
        if archive_reader.is_none() {
            *archive_reader = shared.take_reader();
        }
        let Some(archive) = archive_reader.as_mut() else {
            return Ok(());
        };

        if archive_state.is_none() {
            let buf = reader.buffer();
            let first = &buf[..BLOCK_SIZE];
            if block::hdr_no(first) > shared.first_block_no() {
                // The live stream is already past the archive's start: find
                // the live block inside the archive
                let found = archive.scan_to_match(
                    start_lsn,
                    block::hdr_no(first),
                    block::checksum(first),
                    block::data_len(first),
                )?;
                if found {
                    *archive_state = archive_state.on_match();
                }
            } else {
                // The archive's first block may sit inside this live batch
                let mut lsn = start_lsn;
                for blk in buf[..len].chunks_exact(BLOCK_SIZE) {
                    if block::hdr_no(blk) == shared.first_block_no()
                        && block::checksum(blk) == shared.first_block_checksum()
                    {
                        archive.set_start_lsn(lsn);
                        *archive_state = archive_state.on_match();
                        tracing::info!(lsn, "switched to archived redo log");
                        break;
                    }
                    lsn += BLOCK_SIZE as u64;
                }
            }
        }

        if archive_state.is_matched() && archive.seek(reader.contiguous_lsn()) {
            *archive_state = archive_state.on_position();
        }
        Ok(())
    }

    /// Advance the consumer behind the follower, or drop the registration
    /// once the purge-immune archive has taken over.
    async fn sync_consumer(&mut self) {
        let Some(consumer) = self.consumer.as_mut() else {
            return;
        };
        if self.archive_state.is_positioned() {
            consumer.deregister().await;
        } else {
            consumer.advance(self.reader.contiguous_lsn()).await;
        }
    }

    /// Sleep one copy interval; a stop or abort signal cuts it short.
    async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.copy_interval) => {}
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn stop_target(&self) -> Lsn {
        self.stop_lsn.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
