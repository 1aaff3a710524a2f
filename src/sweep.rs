//! Single-slot in-flight guard shared by the periodic sweeps.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// A slot that at most one sweep may occupy at a time.
#[derive(Debug, Default)]
pub struct SweepSlot {
    busy: AtomicBool,
}

impl SweepSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot, or returns `None` when a sweep is already running.
    /// The slot is released when the guard drops, including during unwind.
    pub fn try_acquire(&self) -> Option<SweepGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard { slot: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of slot ownership.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SweepGuard<'a> {
    slot: &'a SweepSlot,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Counters of one completed sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Metrics visited with work to do.
    pub metrics: usize,
    /// Entries written to the store.
    pub persisted: usize,
    /// Entries left for the next sweep after an error.
    pub failed: usize,
    /// Entries skipped as corrupt.
    pub corrupt: usize,
    /// Entries removed from the cache.
    pub removed: usize,
}

/// How a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepStats),
    /// Another sweep of the same kind held the slot.
    Busy,
    /// The store could not be reached. Nothing was touched.
    StoreUnavailable,
}

impl SweepOutcome {
    /// Metric label for the outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(stats) if stats.failed > 0 => "partial",
            Self::Completed(_) => "completed",
            Self::Busy => "busy",
            Self::StoreUnavailable => "unavailable",
        }
    }

    pub fn stats(&self) -> Option<SweepStats> {
        match self {
            Self::Completed(stats) => Some(*stats),
            _ => None,
        }
    }
}

impl fmt::Display for SweepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
