// SPDX-License-Identifier: MIT

//! Run-scoped fatal-error flag
//!
//! One flag exists per backup run, owned by the orchestrator and handed to
//! the components that can hit fatal conditions. It is set-once and never
//! cleared: once raised, every subsequent read/parse/write result is
//! unspecified and the run proceeds straight to teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared set-once error flag for one backup run.
#[derive(Clone, Debug, Default)]
pub struct ErrorFlag(Arc<AtomicBool>);

impl ErrorFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent; the flag never clears for the run.
    pub fn set(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            tracing::error!("fatal error flag raised for this backup run");
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
