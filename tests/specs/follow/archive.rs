//! Archived-log fallback: splicing the server-managed WAL copy into the
//! follower when the live log rotates out from under it.

use crate::prelude::*;
use hotbak_core::block::{self, BLOCK_SIZE};
use hotbak_core::header::HEADER_SIZE;

fn configure_archiving(h: &Harness) {
    h.control.add_archive_dir("primary", h.dir.path().join("arch"));
    std::fs::create_dir_all(h.dir.path().join("arch")).unwrap();
    h.control
        .set_archive_payload(h.engine.archive_bytes(START_LSN).unwrap());
}

/// Append the engine's newly sealed blocks to the fake server's archive
/// file, the way the archiver streams them.
fn refresh_archive(h: &Harness) {
    let file = h.control.archive_file().expect("archiving started");
    let mut bytes = std::fs::read(&file).unwrap();
    let mut covered = START_LSN + (bytes.len() - HEADER_SIZE) as u64;
    let sealed_end = block::align_down(h.engine.lsn());
    while covered < sealed_end {
        bytes.extend_from_slice(&h.engine.read_raw_block(covered).unwrap());
        covered += BLOCK_SIZE as u64;
    }
    std::fs::write(&file, &bytes).unwrap();
}

#[tokio::test]
async fn follower_splices_to_the_archive_and_survives_log_recycling() {
    let mut h = Harness::new(3000, 1000).with_consumer("hotbak-arch");
    configure_archiving(&h);

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    wait_until("archiving to start", || h.control.archive_file().is_some()).await;

    // Keep the engine writing, refreshing the archive copy alongside; the
    // follower correlates the two streams on a pass that carries new data
    // and switches over.
    for target in [4200u64, 5400, 6600] {
        h.engine.advance_to(target).unwrap();
        refresh_archive(&h);
        wait_until("follower to catch up", || {
            h.manager.scanned_lsn() + BLOCK_SIZE as u64 > target
        })
        .await;
        if h.control.consumer_lsn("hotbak-arch").is_none() {
            break;
        }
    }

    // Deregistration mid-run is the observable effect of POSITIONED: the
    // archive is immune to purging, so the registration is dropped.
    wait_until("consumer handoff to the archive", || {
        h.control.consumer_lsn("hotbak-arch").is_none()
    })
    .await;

    // The live log recycles everything below the write head; only the
    // archive still holds the older bytes.
    h.engine.recycle_below(h.engine.lsn()).unwrap();
    h.engine.advance_to(8000).unwrap();
    refresh_archive(&h);
    wait_until("follower to pass lsn 8000", || {
        h.manager.scanned_lsn() + BLOCK_SIZE as u64 > 8000
    })
    .await;

    // Snapshot the expectation before stop removes the archive: the
    // archived blocks plus the live tail block are the whole stream.
    let archive = h.control.archive_file().unwrap();
    let mut expected = std::fs::read(&archive).unwrap()[HEADER_SIZE..].to_vec();
    let tail = block::align_down(h.engine.lsn());
    expected.extend_from_slice(&h.engine.read_raw_block(tail).unwrap());

    let stop = h.engine.lsn();
    h.manager.stop_at(stop, stop - 700).await.unwrap();

    assert!(h.manager.scanned_lsn() >= stop);
    assert!(!h.manager.is_error());
    assert!(!archive.exists(), "temporary archive is removed after the run");

    let out = h.output();
    assert_eq!(&out[HEADER_SIZE..], &expected[..]);
}

#[tokio::test]
async fn failed_archive_seek_falls_back_to_the_live_log() {
    let mut h = Harness::new(3000, 1000).with_consumer("hotbak-arch");
    configure_archiving(&h);

    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    wait_until("archiving to start", || h.control.archive_file().is_some()).await;

    // Reach POSITIONED first
    for target in [4200u64, 5400, 6600] {
        h.engine.advance_to(target).unwrap();
        refresh_archive(&h);
        wait_until("follower to catch up", || {
            h.manager.scanned_lsn() + BLOCK_SIZE as u64 > target
        })
        .await;
        if h.control.consumer_lsn("hotbak-arch").is_none() {
            break;
        }
    }
    wait_until("consumer handoff to the archive", || {
        h.control.consumer_lsn("hotbak-arch").is_none()
    })
    .await;

    // The archive loses its retained window: every subsequent seek misses,
    // and the follower must keep going from the live log alone.
    let archive = h.control.archive_file().unwrap();
    std::fs::write(&archive, std::fs::read(&archive).unwrap()[..HEADER_SIZE].to_vec()).unwrap();

    h.engine.advance_to(9000).unwrap();
    wait_until("live fallback to pass lsn 9000", || h.manager.scanned_lsn() >= 9000).await;

    let stop = h.engine.lsn();
    h.manager.stop_at(stop, stop - 500).await.unwrap();

    assert!(!h.manager.is_error());
    let out = h.output();
    let expected = h
        .engine
        .stream_bytes(512, block::align_up(h.engine.lsn()))
        .unwrap();
    assert_eq!(&out[HEADER_SIZE..], &expected[..]);
}

#[tokio::test]
async fn follower_completes_when_archiving_is_not_configured() {
    // No archive dirs on the server: the monitor idles out and the run
    // completes purely from the live log.
    let mut h = Harness::new(2000, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();

    h.engine.advance_to(3500).unwrap();
    wait_until("follower to reach lsn 3500", || h.manager.scanned_lsn() >= 3500).await;
    h.manager.stop_at(3500, 3000).await.unwrap();

    assert!(!h.manager.is_error());
}
