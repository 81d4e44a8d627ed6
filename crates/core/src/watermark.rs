// SPDX-License-Identifier: MIT

//! Monotonic LSN watermarks shared across tasks
//!
//! The copy-loop task advances these; the orchestrator and external
//! collaborators read them concurrently. Advancement is `fetch_max`, so a
//! cell can never move backwards regardless of interleaving.

use crate::block::{self, Lsn};
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically non-decreasing LSN cell.
#[derive(Debug, Default)]
pub struct LsnCell(AtomicU64);

impl LsnCell {
    pub fn new(lsn: Lsn) -> Self {
        Self(AtomicU64::new(lsn))
    }

    pub fn get(&self) -> Lsn {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to `lsn` if it is ahead of the current value.
    pub fn advance_to(&self, lsn: Lsn) {
        self.0.fetch_max(lsn, Ordering::AcqRel);
    }
}

/// The follower position shared between the copy task and its observers.
#[derive(Debug, Default)]
pub struct Watermarks {
    /// Highest LSN byte confirmed read and pushed downstream.
    pub scanned: LsnCell,
    /// Highest LSN whose record boundaries have been fully decoded.
    pub parsed: LsnCell,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `scanned` rounded down to a block boundary.
    pub fn contiguous(&self) -> Lsn {
        block::align_down(self.scanned.get())
    }
}

#[cfg(test)]
#[path = "watermark_tests.rs"]
mod tests;
