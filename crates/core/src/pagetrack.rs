// SPDX-License-Identifier: MIT

//! Changed-page tracking
//!
//! Incremental backups only re-copy pages modified inside an LSN interval.
//! The engine-side tracking service writes a binary file of raw
//! (space-id, page-number) pairs for the interval; this module streams that
//! file into a deduplicated per-space change-map the data-file copier
//! consumes. The service may report the same page many times across
//! chunks; the map never under-counts, and the duplicate count is derived
//! for diagnostics rather than tallied.

use crate::block::Lsn;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub type SpaceId = u32;
pub type PageNo = u32;

/// Bytes per raw (space-id, page-number) pair in the change file.
pub const PAIR_SIZE: usize = 8;

/// How many one-second polls to wait for the engine checkpoint to reach
/// the tracking start.
const CHECKPOINT_WAIT_LIMIT: u32 = 600;

#[derive(Debug, Error)]
pub enum PageTrackError {
    #[error("page tracking is not started on the server")]
    NotTracking,
    #[error("tracking starts at lsn {tracking}, after the requested start lsn {start}")]
    TrackingBeyondStart { tracking: Lsn, start: Lsn },
    #[error("engine checkpoint {checkpoint} never reached the tracking start lsn {start}")]
    CheckpointLagging { checkpoint: Lsn, start: Lsn },
    #[error("change file ends with a truncated pair ({0} trailing bytes)")]
    TruncatedPair(usize),
    #[error("page tracking service call failed: {0}")]
    Service(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine-side changed-page tracking service.
#[async_trait]
pub trait PageTrackService: Clone + Send + Sync + 'static {
    /// Associate subsequent service calls with a backup id.
    async fn set_backup_id(&self, id: u64) -> Result<(), PageTrackError>;

    /// LSN tracking has been running since; 0 when tracking is off.
    async fn tracking_start_lsn(&self) -> Result<Lsn, PageTrackError>;

    /// Current engine checkpoint LSN.
    async fn checkpoint_lsn(&self) -> Result<Lsn, PageTrackError>;

    /// Raw changed-page count for the interval, duplicates included.
    async fn changed_page_count(&self, start: Lsn, end: Lsn) -> Result<u64, PageTrackError>;

    /// Ask the service to write the interval's change file; returns its
    /// path.
    async fn write_changed_pages(&self, start: Lsn, end: Lsn) -> Result<PathBuf, PageTrackError>;

    /// Start tracking; returns the tracking start LSN.
    async fn start_tracking(&self) -> Result<Lsn, PageTrackError>;

    /// Stop tracking; returns the LSN tracking stopped at.
    async fn stop_tracking(&self) -> Result<Lsn, PageTrackError>;

    /// Purge tracking data up to `lsn`; returns the purge LSN the server
    /// applied.
    async fn purge_tracking(&self, lsn: Lsn) -> Result<Lsn, PageTrackError>;
}

/// Ordered set of changed page numbers within one space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageSet {
    pages: BTreeSet<PageNo>,
}

impl PageSet {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: PageNo) -> bool {
        self.pages.contains(&page)
    }

    pub fn iter(&self) -> impl Iterator<Item = PageNo> + '_ {
        self.pages.iter().copied()
    }

    /// Maximal contiguous runs as `(first, last)` pairs, the granularity
    /// the data-file copier reads at.
    pub fn ranges(&self) -> Vec<(PageNo, PageNo)> {
        let mut ranges: Vec<(PageNo, PageNo)> = Vec::new();
        for page in self.iter() {
            match ranges.last_mut() {
                Some((_, last)) if *last + 1 == page => *last = page,
                _ => ranges.push((page, page)),
            }
        }
        ranges
    }
}

/// Pages modified per space within one LSN interval.
///
/// Built once per incremental backup; read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct ChangeMap {
    spaces: BTreeMap<SpaceId, PageSet>,
    total_raw: u64,
}

impl ChangeMap {
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn get(&self, space: SpaceId) -> Option<&PageSet> {
        self.spaces.get(&space)
    }

    pub fn spaces(&self) -> impl Iterator<Item = (SpaceId, &PageSet)> + '_ {
        self.spaces.iter().map(|(&space, pages)| (space, pages))
    }

    /// Distinct changed pages across all spaces.
    pub fn distinct_pages(&self) -> u64 {
        self.spaces.values().map(|p| p.len() as u64).sum()
    }

    /// Raw pairs observed in the change file.
    pub fn total_raw(&self) -> u64 {
        self.total_raw
    }

    /// Raw pairs minus distinct pages; derived, so the map can never
    /// under-count.
    pub fn duplicates(&self) -> u64 {
        self.total_raw - self.distinct_pages()
    }

    fn insert(&mut self, space: SpaceId, page: PageNo) {
        self.total_raw += 1;
        self.spaces.entry(space).or_default().pages.insert(page);
    }
}

/// Builds change-maps by driving the tracking service.
pub struct PageTracker<S: PageTrackService> {
    service: S,
    read_chunk_size: usize,
    checkpoint_poll_interval: Duration,
}

impl<S: PageTrackService> PageTracker<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            read_chunk_size: 64 * 1024,
            checkpoint_poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(PAIR_SIZE);
        self
    }

    pub fn with_checkpoint_poll_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_poll_interval = interval;
        self
    }

    /// Build the change-map for `[start_lsn, end_lsn]`.
    pub async fn build(&self, start_lsn: Lsn, end_lsn: Lsn) -> Result<ChangeMap, PageTrackError> {
        if start_lsn == end_lsn {
            tracing::info!(
                lsn = start_lsn,
                "backup lsn equals the last checkpoint lsn; skipping the tracking service"
            );
            return Ok(ChangeMap::default());
        }

        let backup_id = uuid::Uuid::new_v4().as_u64_pair().0;
        self.service.set_backup_id(backup_id).await?;

        let tracking = self.service.tracking_start_lsn().await?;
        if tracking == 0 {
            return Err(PageTrackError::NotTracking);
        }
        if tracking > start_lsn {
            return Err(PageTrackError::TrackingBeyondStart {
                tracking,
                start: start_lsn,
            });
        }

        self.wait_for_checkpoint(start_lsn).await?;

        let expected = self.service.changed_page_count(start_lsn, end_lsn).await?;
        let path = self.service.write_changed_pages(start_lsn, end_lsn).await?;

        let map = self.read_change_file(&path)?;
        if expected < map.distinct_pages() {
            tracing::warn!(
                expected,
                distinct = map.distinct_pages(),
                "service reported fewer changed pages than the change file holds"
            );
        }
        tracing::info!(
            total = map.total_raw(),
            duplicates = map.duplicates(),
            spaces = map.spaces.len(),
            "changed-page map built"
        );
        Ok(map)
    }

    /// The service only covers intervals at or below the engine checkpoint;
    /// wait for it to catch up to the tracking start.
    async fn wait_for_checkpoint(&self, start_lsn: Lsn) -> Result<(), PageTrackError> {
        let mut checkpoint = 0;
        for _ in 0..CHECKPOINT_WAIT_LIMIT {
            checkpoint = self.service.checkpoint_lsn().await?;
            if checkpoint >= start_lsn {
                return Ok(());
            }
            tracing::info!(
                checkpoint,
                start_lsn,
                "waiting for the engine checkpoint to reach the tracking start"
            );
            tokio::time::sleep(self.checkpoint_poll_interval).await;
        }
        Err(PageTrackError::CheckpointLagging {
            checkpoint,
            start: start_lsn,
        })
    }

    /// Stream the binary change file in fixed-size chunks.
    fn read_change_file(&self, path: &std::path::Path) -> Result<ChangeMap, PageTrackError> {
        let mut file = std::fs::File::open(path)?;
        let mut map = ChangeMap::default();
        let mut chunk = vec![0u8; self.read_chunk_size - self.read_chunk_size % PAIR_SIZE];
        let mut carry = 0usize;

        loop {
            let read = read_fully(&mut file, &mut chunk[carry..])?;
            let available = carry + read;
            let usable = available - available % PAIR_SIZE;

            for pair in chunk[..usable].chunks_exact(PAIR_SIZE) {
                let space = u32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]);
                let page = u32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]);
                map.insert(space, page);
            }

            carry = available - usable;
            if carry > 0 {
                let from = usable;
                chunk.copy_within(from..available, 0);
            }
            if read == 0 {
                if carry > 0 {
                    return Err(PageTrackError::TruncatedPair(carry));
                }
                return Ok(map);
            }
        }
    }
}

fn read_fully(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// In-memory tracking service for tests.
#[derive(Clone)]
pub struct FakePageTrack {
    state: Arc<Mutex<FakePageTrackState>>,
}

struct FakePageTrackState {
    dir: PathBuf,
    tracking_start_lsn: Lsn,
    checkpoint_lsn: Lsn,
    pairs: Vec<(SpaceId, PageNo)>,
    count_override: Option<u64>,
    backup_id: Option<u64>,
    fail_calls: bool,
    truncate_file: bool,
}

impl FakePageTrack {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakePageTrackState {
                dir: dir.into(),
                tracking_start_lsn: 1,
                checkpoint_lsn: u64::MAX,
                pairs: Vec::new(),
                count_override: None,
                backup_id: None,
                fail_calls: false,
                truncate_file: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakePageTrackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_tracking_start_lsn(&self, lsn: Lsn) {
        self.lock().tracking_start_lsn = lsn;
    }

    pub fn set_checkpoint_lsn(&self, lsn: Lsn) {
        self.lock().checkpoint_lsn = lsn;
    }

    pub fn add_pairs(&self, pairs: &[(SpaceId, PageNo)]) {
        self.lock().pairs.extend_from_slice(pairs);
    }

    pub fn set_count_override(&self, count: u64) {
        self.lock().count_override = Some(count);
    }

    pub fn fail_calls(&self) {
        self.lock().fail_calls = true;
    }

    pub fn truncate_file(&self) {
        self.lock().truncate_file = true;
    }

    pub fn backup_id(&self) -> Option<u64> {
        self.lock().backup_id
    }

    fn check(&self) -> Result<(), PageTrackError> {
        if self.lock().fail_calls {
            return Err(PageTrackError::Service("component not installed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PageTrackService for FakePageTrack {
    async fn set_backup_id(&self, id: u64) -> Result<(), PageTrackError> {
        self.check()?;
        self.lock().backup_id = Some(id);
        Ok(())
    }

    async fn tracking_start_lsn(&self) -> Result<Lsn, PageTrackError> {
        self.check()?;
        Ok(self.lock().tracking_start_lsn)
    }

    async fn checkpoint_lsn(&self) -> Result<Lsn, PageTrackError> {
        self.check()?;
        Ok(self.lock().checkpoint_lsn)
    }

    async fn changed_page_count(&self, _start: Lsn, _end: Lsn) -> Result<u64, PageTrackError> {
        self.check()?;
        let state = self.lock();
        Ok(state.count_override.unwrap_or(state.pairs.len() as u64))
    }

    async fn write_changed_pages(&self, _start: Lsn, _end: Lsn) -> Result<PathBuf, PageTrackError> {
        self.check()?;
        let state = self.lock();
        let id = state.backup_id.unwrap_or(0);
        let path = state.dir.join(format!("{id}.chgfile"));
        let mut bytes = Vec::with_capacity(state.pairs.len() * PAIR_SIZE);
        for &(space, page) in &state.pairs {
            bytes.extend_from_slice(&space.to_be_bytes());
            bytes.extend_from_slice(&page.to_be_bytes());
        }
        if state.truncate_file && !bytes.is_empty() {
            bytes.truncate(bytes.len() - 3);
        }
        std::fs::write(&path, &bytes)?;
        Ok(path)
    }

    async fn start_tracking(&self) -> Result<Lsn, PageTrackError> {
        self.check()?;
        let mut state = self.lock();
        if state.tracking_start_lsn == 0 {
            state.tracking_start_lsn = state.checkpoint_lsn.min(1);
        }
        Ok(state.tracking_start_lsn)
    }

    async fn stop_tracking(&self) -> Result<Lsn, PageTrackError> {
        self.check()?;
        let mut state = self.lock();
        let lsn = state.tracking_start_lsn;
        state.tracking_start_lsn = 0;
        Ok(lsn)
    }

    async fn purge_tracking(&self, lsn: Lsn) -> Result<Lsn, PageTrackError> {
        self.check()?;
        Ok(lsn)
    }
}

#[cfg(test)]
#[path = "pagetrack_tests.rs"]
mod tests;
