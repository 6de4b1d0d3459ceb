//! Log statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the log.
#[derive(Debug, Default)]
pub struct LogStats {
    /// Blocks placed in the log buffer.
    pub blocks_written: AtomicU64,
    /// Bytes written to segment files.
    pub bytes_flushed: AtomicU64,
    /// Completed flushes.
    pub flushes: AtomicU64,
    /// Committed transactions.
    pub commits: AtomicU64,
    /// Transactions discarded after allocating log space.
    pub discards: AtomicU64,
    /// Blocks spilled by transactions too large for one block.
    pub overflow_blocks: AtomicU64,
    /// Segments opened while running.
    pub segments_created: AtomicU64,
}

impl LogStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_block(&self) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, bytes: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            overflow_blocks: self.overflow_blocks.load(Ordering::Relaxed),
            segments_created: self.segments_created.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`LogStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStatsSnapshot {
    /// Blocks placed in the log buffer.
    pub blocks_written: u64,
    /// Bytes written to segment files.
    pub bytes_flushed: u64,
    /// Completed flushes.
    pub flushes: u64,
    /// Committed transactions.
    pub commits: u64,
    /// Transactions discarded after allocating log space.
    pub discards: u64,
    /// Spilled overflow blocks.
    pub overflow_blocks: u64,
    /// Segments opened while running.
    pub segments_created: u64,
}
