// SPDX-License-Identifier: MIT

//! On-disk WAL segment set
//!
//! The engine keeps the live WAL as an ordered set of segment files in one
//! directory, each named for the LSN of its first log block:
//! `wal_<16-hex-lsn>.seg`. A segment is a header block followed by
//! consecutive log blocks, so a block's file offset follows from the
//! segment's start LSN, not from a fixed stride. Segments are created
//! (rotation) and removed (recycling) concurrently with the follower.

use crate::block::{self, Lsn};
use crate::header::HEADER_SIZE;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".seg";

/// File name for the segment starting at `start_lsn`.
pub fn segment_file_name(start_lsn: Lsn) -> String {
    format!("{SEGMENT_PREFIX}{start_lsn:016x}{SEGMENT_SUFFIX}")
}

/// Parse a segment file name back into its start LSN.
pub fn parse_segment_name(name: &str) -> Option<Lsn> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    let lsn = Lsn::from_str_radix(hex, 16).ok()?;
    (lsn == block::align_down(lsn)).then_some(lsn)
}

/// A located segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start_lsn: Lsn,
    pub path: PathBuf,
}

impl Segment {
    /// File offset of the block containing `lsn`.
    ///
    /// `lsn` must be at or past this segment's start.
    pub fn offset_for(&self, lsn: Lsn) -> u64 {
        debug_assert!(lsn >= self.start_lsn);
        HEADER_SIZE as u64 + (block::align_down(lsn) - self.start_lsn)
    }
}

/// The currently known set of live segments, keyed by start LSN.
#[derive(Debug, Default)]
pub struct SegmentSet {
    dir: PathBuf,
    segments: BTreeMap<Lsn, PathBuf>,
}

impl SegmentSet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segments: BTreeMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Re-scan the directory, picking up rotated-in segments and dropping
    /// recycled ones.
    pub fn refresh(&mut self) -> std::io::Result<()> {
        let mut segments = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(start_lsn) = parse_segment_name(name) {
                segments.insert(start_lsn, entry.path());
            }
        }
        self.segments = segments;
        Ok(())
    }

    /// Segment owning `lsn`: the one with the greatest start LSN at or
    /// below it.
    pub fn locate(&self, lsn: Lsn) -> Option<Segment> {
        self.segments
            .range(..=lsn)
            .next_back()
            .map(|(&start_lsn, path)| Segment {
                start_lsn,
                path: path.clone(),
            })
    }

    /// The segment immediately following the one starting at `start_lsn`.
    pub fn next_after(&self, start_lsn: Lsn) -> Option<Segment> {
        self.segments
            .range(start_lsn + 1..)
            .next()
            .map(|(&start_lsn, path)| Segment {
                start_lsn,
                path: path.clone(),
            })
    }

    /// Start LSNs of all known segments, in order.
    pub fn starts(&self) -> impl Iterator<Item = Lsn> + '_ {
        self.segments.keys().copied()
    }
}

#[cfg(test)]
#[path = "segment_tests.rs"]
mod tests;
