//! Continuous-copy lifecycle: priming, following, stop-point guarantees.

use crate::prelude::*;
use hotbak_core::block;
use hotbak_core::header::HEADER_SIZE;
use hotbak_core::CopyError;

#[tokio::test]
async fn backup_reaches_the_agreed_stop_point() {
    // Starting checkpoint 1000; the engine keeps writing until LSN 5000
    // while data files are being copied elsewhere.
    let mut h = Harness::new(1500, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();

    h.engine.advance_to(5000).unwrap();
    wait_until("follower to reach lsn 5000", || h.manager.scanned_lsn() >= 5000).await;

    h.manager.stop_at(5000, 4800).await.unwrap();

    assert!(h.manager.scanned_lsn() >= 5000);
    assert!(h.manager.has_parsed_lsn(4800), "DDL gating point must be parsed");
    assert!(!h.manager.is_error());

    // The output holds exactly the stream from the checkpoint's block
    // boundary through the stop point.
    let out = h.output();
    assert!(hotbak_core::header::validate(&out[..HEADER_SIZE]).is_ok());
    let end = block::align_up(h.engine.lsn());
    let expected = h.engine.stream_bytes(block::align_down(1000), end).unwrap();
    assert_eq!(&out[HEADER_SIZE..], &expected[..]);
}

#[tokio::test]
async fn stop_fails_iff_the_checkpoint_outruns_the_copy() {
    let mut h = Harness::new(3000, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();

    // The engine checkpointed at 4000 but only 3000 bytes of log exist to
    // copy: the backup cannot be made consistent.
    let result = h.manager.stop_at(3000, 4000).await;

    assert!(matches!(
        result,
        Err(CopyError::CheckpointBeyondScanned { checkpoint: 4000, .. })
    ));
    assert!(h.manager.is_error());
    // Even the failed run leaves a closed, inspectable output behind
    assert!(h.output_path().exists());
}

#[tokio::test]
async fn abort_stops_without_an_lsn_target() {
    let mut h = Harness::new(4000, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();

    h.engine.advance_to(6000).unwrap();
    h.manager.abort().await;

    // No stop-point validation on abort; the output is closed regardless
    let out = h.output();
    assert!(out.len() >= HEADER_SIZE);
    assert_eq!(out.len() % block::BLOCK_SIZE, 0);
}

#[tokio::test]
async fn watermarks_never_violate_their_ordering() {
    let mut h = Harness::new(2000, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();

    for target in [3000u64, 4500, 6000] {
        h.engine.advance_to(target).unwrap();
        wait_until("follower to catch up", || {
            let parsed = h.manager.parsed_lsn();
            let scanned = h.manager.scanned_lsn();
            assert!(parsed <= scanned);
            scanned >= target
        })
        .await;
    }

    h.manager.stop_at(6000, 5500).await.unwrap();
    assert!(h.manager.parsed_lsn() <= h.manager.scanned_lsn());
}

#[tokio::test]
async fn consumer_protects_unread_log_until_the_run_ends() {
    let mut h = Harness::new(2500, 1000).with_consumer("hotbak-spec");
    h.manager.init(&h.sink).await.unwrap();
    assert_eq!(h.control.consumer_lsn("hotbak-spec"), Some(None));

    h.manager.start().await.unwrap();
    h.engine.advance_to(4000).unwrap();
    wait_until("follower to reach lsn 4000", || h.manager.scanned_lsn() >= 4000).await;

    // The registered LSN trails the follower, never the other way around
    if let Some(Some(lsn)) = h.control.consumer_lsn("hotbak-spec") {
        assert!(lsn <= h.manager.scanned_lsn());
    }

    h.manager.stop_at(4000, 3500).await.unwrap();
    assert!(h.control.high_advance().unwrap() >= 1000);
    assert_eq!(h.control.consumer_lsn("hotbak-spec"), None);
}
