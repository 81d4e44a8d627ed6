//! Shared harness for follower specs.

use hotbak_core::testsupport::SyntheticEngine;
use hotbak_core::{FakeControlPlane, FollowerConfig, LocalSink, LogCopyManager};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

pub const START_LSN: u64 = 512;

pub struct Harness {
    pub dir: TempDir,
    pub engine: SyntheticEngine,
    pub sink: LocalSink,
    pub control: FakeControlPlane,
    pub manager: LogCopyManager<FakeControlPlane, LocalSink>,
}

impl Harness {
    /// Engine advanced to `advance_to` with a stamped `checkpoint`, and a
    /// manager tuned for fast test turnaround.
    pub fn new(advance_to: u64, checkpoint: u64) -> Self {
        let dir = TempDir::new().unwrap();
        // Small segments so rotation and recycling actually happen
        let mut engine =
            SyntheticEngine::with_options(dir.path().join("wal"), START_LSN, 8, None).unwrap();
        engine.advance_to(advance_to).unwrap();
        engine.set_checkpoint(checkpoint).unwrap();

        let sink = LocalSink::new(dir.path().join("backup"));
        let control = FakeControlPlane::new();
        let config = FollowerConfig::new(dir.path().join("wal"))
            .with_copy_interval(Duration::from_millis(10))
            .with_archive_poll_interval(Duration::from_millis(5))
            .with_read_buffer_size(64 * 1024)
            .with_scan_chunk_size(4 * 1024);
        let manager = LogCopyManager::new(config, Some(control.clone()));

        Self {
            dir,
            engine,
            sink,
            control,
            manager,
        }
    }

    /// Add a consumer registration to the manager's configuration.
    pub fn with_consumer(mut self, name: &str) -> Self {
        let config = FollowerConfig::new(self.dir.path().join("wal"))
            .with_copy_interval(Duration::from_millis(10))
            .with_archive_poll_interval(Duration::from_millis(5))
            .with_read_buffer_size(64 * 1024)
            .with_scan_chunk_size(4 * 1024)
            .with_consumer_name(name);
        self.manager = LogCopyManager::new(config, Some(self.control.clone()));
        self
    }

    pub fn output_path(&self) -> PathBuf {
        self.sink.dir().join(hotbak_core::manager::OUTPUT_LOG_NAME)
    }

    pub fn output(&self) -> Vec<u8> {
        std::fs::read(self.output_path()).unwrap()
    }
}

/// Poll until `condition` holds, failing the test after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}
