//! Engine statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters maintained by the engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Transactions started.
    pub begins: AtomicU64,
    /// Transactions committed.
    pub commits: AtomicU64,
    /// Transactions aborted, explicitly or by drop.
    pub aborts: AtomicU64,
    /// Writes rejected by first-updater-wins.
    pub conflicts: AtomicU64,
    /// Versions loaded from the log or a checkpoint on first use.
    pub pins: AtomicU64,
    /// Checkpoints written.
    pub checkpoints: AtomicU64,
    /// Versions released by garbage collection.
    pub versions_reclaimed: AtomicU64,
}

impl EngineStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            pins: self.pins.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            versions_reclaimed: self.versions_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Transactions started.
    pub begins: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions aborted.
    pub aborts: u64,
    /// Writes rejected by first-updater-wins.
    pub conflicts: u64,
    /// Versions loaded on first use.
    pub pins: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Versions released by garbage collection.
    pub versions_reclaimed: u64,
}
