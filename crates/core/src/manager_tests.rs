// SPDX-License-Identifier: MIT

use super::*;
use crate::control::FakeControlPlane;
use crate::header::HEADER_SIZE;
use crate::sink::LocalSink;
use crate::testsupport::SyntheticEngine;
use std::time::Duration;
use tempfile::TempDir;

const START: Lsn = 512;

struct Harness {
    _dir: TempDir,
    engine: SyntheticEngine,
    sink: LocalSink,
    control: FakeControlPlane,
    manager: LogCopyManager<FakeControlPlane, LocalSink>,
}

fn harness(advance_to: Lsn, checkpoint: Lsn) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut engine = SyntheticEngine::new(dir.path().join("wal"), START).unwrap();
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

    Harness {
        _dir: dir,
        engine,
        sink,
        control,
        manager,
    }
}

fn output_bytes(h: &Harness) -> Vec<u8> {
    std::fs::read(h.sink.dir().join(OUTPUT_LOG_NAME)).unwrap()
}

#[tokio::test]
async fn init_seeds_checkpoint_and_writes_header() {
    let mut h = harness(3000, 1000);

    h.manager.init(&h.sink).await.unwrap();

    assert_eq!(h.manager.start_checkpoint_lsn(), 1000);
    assert_eq!(h.manager.scanned_lsn(), 1000);
    h.manager.abort().await;

    let out = output_bytes(&h);
    assert_eq!(out.len(), HEADER_SIZE);
    assert!(crate::header::validate(&out).is_ok());
    assert_eq!(crate::header::checkpoint_lsn(&out), 1000);
}

#[tokio::test]
async fn stop_at_reaches_the_target_and_mirrors_the_stream() {
    let mut h = harness(5000, 1000);

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    h.manager.stop_at(5000, 4800).await.unwrap();

    assert!(h.manager.scanned_lsn() >= 5000);
    assert_eq!(h.manager.scanned_lsn(), h.engine.lsn());
    assert!(h.manager.has_parsed_lsn(4800));
    assert!(!h.manager.is_error());
    assert_eq!(h.manager.last_checkpoint_lsn(), 4800);

    // Output: stamped header, then the exact stream bytes from the
    // checkpoint's block boundary through the final partial block
    let out = output_bytes(&h);
    let end = block::align_up(h.engine.lsn());
    let expected = h.engine.stream_bytes(512, end).unwrap();
    assert_eq!(&out[HEADER_SIZE..], &expected[..]);
}

#[tokio::test]
async fn stop_at_fails_when_checkpoint_exceeds_scanned() {
    let mut h = harness(3000, 1000);

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    let result = h.manager.stop_at(3000, 4000).await;

    assert!(matches!(
        result,
        Err(CopyError::CheckpointBeyondScanned { checkpoint: 4000, .. })
    ));
    assert!(h.manager.is_error());
    // The output is closed and left in place for postmortem inspection
    let out = output_bytes(&h);
    assert!(out.len() >= HEADER_SIZE);
}

#[tokio::test]
async fn abort_tears_down_and_closes_the_output() {
    let mut h = harness(4000, 1000);

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    h.manager.abort().await;

    // Closed output: readable, header intact
    let out = output_bytes(&h);
    assert!(crate::header::validate(&out[..HEADER_SIZE]).is_ok());
}

#[tokio::test]
async fn background_loop_follows_new_writes() {
    let mut h = harness(2000, 1000);

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    assert!(h.manager.scanned_lsn() >= 2000);

    h.engine.advance_to(6000).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.manager.scanned_lsn() < 6000 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("follower never caught up");

    h.manager.stop_at(6000, 5500).await.unwrap();
    assert!(h.manager.has_parsed_lsn(5500));
}

#[tokio::test]
async fn fatal_mismatch_during_priming_is_surfaced() {
    let mut h = harness(2000, 1000);
    // A block from the future at the position the follower reads next
    let mut blk = [0u8; BLOCK_SIZE];
    block::set_hdr_no(&mut blk, block::block_no_for_lsn(1024) + 7);
    block::set_data_len(&mut blk, BLOCK_SIZE);
    block::set_epoch(&mut blk, 1);
    block::set_checksum(&mut blk);
    h.engine.write_raw_block(1024, &blk).unwrap();

    h.manager.init(&h.sink).await.unwrap();
    let result = h.manager.start().await;

    assert!(matches!(result, Err(CopyError::Read(ReadError::BlockMismatch { .. }))));
    assert!(h.manager.is_error());
    // Output closed even on the error path
    let out = output_bytes(&h);
    assert_eq!(out.len() % BLOCK_SIZE, 0);
    h.manager.abort().await;
}

#[tokio::test]
async fn consumer_is_registered_advanced_and_deregistered() {
    let dir = TempDir::new().unwrap();
    let mut engine = SyntheticEngine::new(dir.path().join("wal"), START).unwrap();
    engine.advance_to(4000).unwrap();
    engine.set_checkpoint(1000).unwrap();

    let sink = LocalSink::new(dir.path().join("backup"));
    let control = FakeControlPlane::new();
    let config = FollowerConfig::new(dir.path().join("wal"))
        .with_copy_interval(Duration::from_millis(10))
        .with_consumer_name("hotbak-run");
    let mut manager: LogCopyManager<FakeControlPlane, LocalSink> =
        LogCopyManager::new(config, Some(control.clone()));

    manager.init(&sink).await.unwrap();
    assert_eq!(control.consumer_lsn("hotbak-run"), Some(None));

    manager.start().await.unwrap();
    manager.stop_at(4000, 3500).await.unwrap();

    // Advanced during the run, deregistered at the end
    assert!(control.high_advance().unwrap() >= 1000);
    assert_eq!(control.consumer_lsn("hotbak-run"), None);
}

#[tokio::test]
async fn consumer_registration_failure_fails_init() {
    let dir = TempDir::new().unwrap();
    let mut engine = SyntheticEngine::new(dir.path().join("wal"), START).unwrap();
    engine.advance_to(3000).unwrap();
    engine.set_checkpoint(1000).unwrap();

    let sink = LocalSink::new(dir.path().join("backup"));
    let control = FakeControlPlane::new();
    control.fail_register();
    let config = FollowerConfig::new(dir.path().join("wal"))
        .with_consumer_name("hotbak-run");
    let mut manager: LogCopyManager<FakeControlPlane, LocalSink> =
        LogCopyManager::new(config, Some(control));

    let result = manager.init(&sink).await;

    assert!(matches!(result, Err(CopyError::Control(_))));
    // The output file was opened, got its header, and was closed again
    let out = std::fs::read(sink.dir().join(OUTPUT_LOG_NAME)).unwrap();
    assert_eq!(out.len(), HEADER_SIZE);
}

#[tokio::test]
async fn runs_without_a_control_plane() {
    let dir = TempDir::new().unwrap();
    let mut engine = SyntheticEngine::new(dir.path().join("wal"), START).unwrap();
    engine.advance_to(3000).unwrap();
    engine.set_checkpoint(1000).unwrap();

    let sink = LocalSink::new(dir.path().join("backup"));
    let config = FollowerConfig::new(dir.path().join("wal"))
        .with_copy_interval(Duration::from_millis(10));
    let mut manager: LogCopyManager<FakeControlPlane, LocalSink> =
        LogCopyManager::new(config, None);

    manager.init(&sink).await.unwrap();
    manager.start().await.unwrap();
    manager.stop_at(3000, 2500).await.unwrap();

    assert!(manager.scanned_lsn() >= 3000);
}

#[tokio::test]
async fn has_parsed_lsn_gates_on_the_watermark() {
    let mut h = harness(4000, 1000);

    // Nothing parsed yet: everything is considered safe
    assert!(h.manager.has_parsed_lsn(u64::MAX));

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    h.manager.stop_at(4000, 3500).await.unwrap();

    let parsed = h.manager.parsed_lsn();
    assert!(parsed >= 3500);
    assert!(h.manager.has_parsed_lsn(parsed));
    // Less than one block ahead still passes
    assert!(h.manager.has_parsed_lsn(parsed + BLOCK_SIZE as u64 - 1));
    assert!(!h.manager.has_parsed_lsn(parsed + 2 * BLOCK_SIZE as u64));
}

#[tokio::test]
async fn watermarks_stay_ordered_for_the_whole_run() {
    let mut h = harness(2000, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();

    for target in [3000u64, 4200, 5600] {
        h.engine.advance_to(target).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.manager.scanned_lsn() < target {
                let parsed = h.manager.parsed_lsn();
                let scanned = h.manager.scanned_lsn();
                assert!(parsed <= scanned, "parsed {parsed} ran ahead of scanned {scanned}");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("follower never caught up");
    }

    h.manager.stop_at(5600, 5000).await.unwrap();
    assert!(h.manager.parsed_lsn() <= h.manager.scanned_lsn());
}
