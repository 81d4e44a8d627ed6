//! Incremental backups: scoping the data-file copier by changed pages.

use crate::prelude::*;
use hotbak_core::pagetrack::{PageTracker, PageTrackService};
use hotbak_core::{FakePageTrack, PageTrackError};
use std::time::Duration;

fn tracker(fake: &FakePageTrack) -> PageTracker<FakePageTrack> {
    PageTracker::new(fake.clone())
        .with_read_chunk_size(64)
        .with_checkpoint_poll_interval(Duration::from_millis(5))
}

#[tokio::test]
async fn change_map_scopes_the_interval_between_two_backups() {
    // A full backup ended at checkpoint 1000; the next incremental covers
    // everything up to the follower's stop point.
    let mut h = Harness::new(1500, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    h.engine.advance_to(5000).unwrap();
    wait_until("follower to reach lsn 5000", || h.manager.scanned_lsn() >= 5000).await;
    h.manager.stop_at(5000, 4800).await.unwrap();

    let fake = FakePageTrack::new(h.dir.path());
    fake.set_tracking_start_lsn(900);
    // 6 raw pairs, one duplicate
    fake.add_pairs(&[(3, 7), (3, 8), (5, 1), (5, 1), (5, 2), (9, 100)]);

    let map = tracker(&fake)
        .build(h.manager.start_checkpoint_lsn(), h.manager.scanned_lsn())
        .await
        .unwrap();

    assert_eq!(map.total_raw(), 6);
    assert_eq!(map.distinct_pages(), 5);
    assert_eq!(map.duplicates(), 1);
    // The copier walks contiguous runs per space
    assert_eq!(map.get(3).unwrap().ranges(), vec![(7, 8)]);
    assert_eq!(map.get(5).unwrap().ranges(), vec![(1, 2)]);
}

#[tokio::test]
async fn unchanged_interval_needs_no_service_call() {
    let h = Harness::new(1500, 1000);
    let fake = FakePageTrack::new(h.dir.path());
    fake.fail_calls(); // would fail loudly if consulted

    let map = tracker(&fake).build(4800, 4800).await.unwrap();

    assert!(map.is_empty());
}

#[tokio::test]
async fn missing_service_only_fails_the_incremental_path() {
    // The follower itself completes without any tracking service...
    let mut h = Harness::new(2000, 1000);
    h.manager.init(&h.sink).await.unwrap();
    h.manager.start().await.unwrap();
    h.manager.stop_at(2000, 1800).await.unwrap();
    assert!(!h.manager.is_error());

    // ...while the change-map build surfaces the failure to the caller
    let fake = FakePageTrack::new(h.dir.path());
    fake.fail_calls();
    let result = tracker(&fake).build(1000, 2000).await;

    assert!(matches!(result, Err(PageTrackError::Service(_))));
}

#[tokio::test]
async fn tracking_lifecycle_round_trips() {
    let h = Harness::new(1500, 1000);
    let fake = FakePageTrack::new(h.dir.path());
    fake.set_tracking_start_lsn(0);

    let started_at = fake.start_tracking().await.unwrap();
    assert!(fake.tracking_start_lsn().await.unwrap() == started_at);

    let stopped_at = fake.stop_tracking().await.unwrap();
    assert_eq!(fake.purge_tracking(stopped_at).await.unwrap(), stopped_at);
    assert_eq!(fake.tracking_start_lsn().await.unwrap(), 0);
}
