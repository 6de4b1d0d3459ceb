//! Epoch-based reclamation of old versions.
//!
//! Pruning cuts the tail off a version chain once no snapshot can see it, but
//! a reader that started before the cut may still be walking that tail. Tails
//! are therefore retired with the epoch current at the time, and released
//! only once every reader pinned at or before that epoch has finished.
//!
//! # Key Components
//!
//! - [`Epoch`]: a monotonically increasing epoch number
//! - [`EpochGuard`]: RAII guard that pins an epoch for a reader
//! - [`EpochManager`]: tracks pinned epochs and the safe-to-reclaim bound
//! - [`GarbageCollector`]: holds retired tails until their epoch is safe

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::object::Object;

/// A monotonically increasing epoch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    /// The zero epoch.
    pub const ZERO: Self = Self(0);

    /// Creates a new epoch.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next epoch.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous epoch (saturating at 0).
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

#[derive(Debug, Clone)]
struct ReaderInfo {
    id: u64,
    epoch: Epoch,
    started_at: Instant,
}

/// A guard that pins an epoch while held.
///
/// Dropping it unregisters the reader, which may make its epoch reclaimable.
pub struct EpochGuard {
    manager: Arc<EpochManager>,
    epoch: Epoch,
    reader_id: u64,
}

impl EpochGuard {
    /// Returns the pinned epoch.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.manager.unpin(self.reader_id);
    }
}

impl fmt::Debug for EpochGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochGuard")
            .field("epoch", &self.epoch)
            .field("reader_id", &self.reader_id)
            .finish()
    }
}

/// Configuration for the epoch manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Minimum time between automatic epoch advances.
    pub epoch_interval: Duration,
    /// Readers older than this are dropped by [`EpochManager::cleanup_stale_readers`].
    pub reader_timeout: Duration,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            epoch_interval: Duration::from_millis(10),
            reader_timeout: Duration::from_secs(60),
        }
    }
}

/// Manages epochs and tracks active readers.
pub struct EpochManager {
    current_epoch: AtomicU64,
    next_reader_id: AtomicU64,
    readers: RwLock<Vec<ReaderInfo>>,
    safe_epoch: AtomicU64,
    config: EpochConfig,
    last_advance: Mutex<Instant>,
}

impl EpochManager {
    /// Creates a new epoch manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(EpochConfig::default())
    }

    /// Creates an epoch manager with custom configuration.
    ///
    /// Epochs start at 1 so that the zero epoch is always reclaimable.
    pub fn with_config(config: EpochConfig) -> Self {
        Self {
            current_epoch: AtomicU64::new(1),
            next_reader_id: AtomicU64::new(1),
            readers: RwLock::new(Vec::new()),
            safe_epoch: AtomicU64::new(0),
            config,
            last_advance: Mutex::new(Instant::now()),
        }
    }

    /// Returns the current epoch.
    pub fn current_epoch(&self) -> Epoch {
        Epoch::new(self.current_epoch.load(AtomicOrdering::Acquire))
    }

    /// Returns the newest epoch that no reader still pins.
    pub fn safe_epoch(&self) -> Epoch {
        Epoch::new(self.safe_epoch.load(AtomicOrdering::Acquire))
    }

    /// Advances to the next epoch.
    pub fn advance_epoch(&self) -> Epoch {
        let new_epoch = self.current_epoch.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        *self.last_advance.lock() = Instant::now();
        self.update_safe_epoch();
        Epoch::new(new_epoch)
    }

    /// Advances the epoch if the configured interval has passed.
    pub fn try_advance_epoch(&self) -> Option<Epoch> {
        let elapsed = self.last_advance.lock().elapsed();
        if elapsed >= self.config.epoch_interval {
            Some(self.advance_epoch())
        } else {
            None
        }
    }

    /// Pins the current epoch and returns a guard.
    ///
    /// While the guard is held, the pinned epoch and every later one stay
    /// unreclaimable.
    pub fn pin(self: &Arc<Self>) -> EpochGuard {
        let reader_id = self.next_reader_id.fetch_add(1, AtomicOrdering::SeqCst);
        let epoch = {
            let mut readers = self.readers.write();
            let epoch = self.current_epoch();
            readers.push(ReaderInfo {
                id: reader_id,
                epoch,
                started_at: Instant::now(),
            });
            epoch
        };

        EpochGuard {
            manager: Arc::clone(self),
            epoch,
            reader_id,
        }
    }

    fn unpin(&self, reader_id: u64) {
        self.readers.write().retain(|r| r.id != reader_id);
        self.update_safe_epoch();
    }

    fn update_safe_epoch(&self) {
        let readers = self.readers.read();
        let current = self.current_epoch();
        let min_pinned = readers.iter().map(|r| r.epoch).min().unwrap_or(current);

        self.safe_epoch
            .store(min_pinned.prev().as_u64(), AtomicOrdering::Release);
    }

    /// Returns the number of active readers.
    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Checks if an epoch is safe to reclaim.
    pub fn is_safe_to_reclaim(&self, epoch: Epoch) -> bool {
        epoch <= self.safe_epoch()
    }

    /// Drops readers registered longer than the configured timeout.
    ///
    /// Returns the number of readers removed.
    pub fn cleanup_stale_readers(&self) -> usize {
        let mut readers = self.readers.write();
        let before_len = readers.len();
        let timeout = self.config.reader_timeout;

        readers.retain(|r| r.started_at.elapsed() < timeout);

        let removed = before_len - readers.len();
        if removed > 0 {
            drop(readers);
            self.update_safe_epoch();
        }
        removed
    }

    /// Returns statistics about the epoch manager.
    pub fn stats(&self) -> EpochStats {
        let readers = self.readers.read();
        EpochStats {
            current_epoch: self.current_epoch(),
            safe_epoch: self.safe_epoch(),
            reader_count: readers.len(),
            oldest_reader_epoch: readers.iter().map(|r| r.epoch).min(),
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochManager")
            .field("current_epoch", &self.current_epoch())
            .field("safe_epoch", &self.safe_epoch())
            .field("reader_count", &self.reader_count())
            .finish()
    }
}

/// Statistics about the epoch manager.
#[derive(Debug, Clone)]
pub struct EpochStats {
    /// Current epoch.
    pub current_epoch: Epoch,
    /// Safe epoch for reclamation.
    pub safe_epoch: Epoch,
    /// Number of active readers.
    pub reader_count: usize,
    /// Oldest pinned epoch (if any).
    pub oldest_reader_epoch: Option<Epoch>,
}

struct GarbageEntry {
    retired_epoch: Epoch,
    tails: Vec<Arc<Object>>,
    version_count: usize,
}

/// Configuration for the garbage collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Minimum interval between runs started by [`GarbageCollector::try_collect`].
    pub gc_interval: Duration,
    /// Versions released per run before stopping.
    pub max_versions_per_run: usize,
    /// Pending entries that trigger a collection from `retire`.
    pub force_gc_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_millis(100),
            max_versions_per_run: 10_000,
            force_gc_threshold: 1_000,
        }
    }
}

/// Statistics about garbage collection.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Total number of GC runs.
    pub runs: AtomicU64,
    /// Total versions released.
    pub versions_collected: AtomicU64,
    /// Total chain tails released.
    pub chains_pruned: AtomicU64,
}

impl GcStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a GC run.
    pub fn record_run(&self, versions: usize, chains: usize) {
        self.runs.fetch_add(1, AtomicOrdering::Relaxed);
        self.versions_collected
            .fetch_add(versions as u64, AtomicOrdering::Relaxed);
        self.chains_pruned
            .fetch_add(chains as u64, AtomicOrdering::Relaxed);
    }

    /// Returns the total number of runs.
    pub fn total_runs(&self) -> u64 {
        self.runs.load(AtomicOrdering::Relaxed)
    }

    /// Returns the total versions released.
    pub fn total_versions_collected(&self) -> u64 {
        self.versions_collected.load(AtomicOrdering::Relaxed)
    }

    /// Returns the total chain tails released.
    pub fn total_chains_pruned(&self) -> u64 {
        self.chains_pruned.load(AtomicOrdering::Relaxed)
    }
}

/// Holds pruned chain tails until no reader can reach them.
pub struct GarbageCollector {
    epoch_manager: Arc<EpochManager>,
    garbage_queue: Mutex<VecDeque<GarbageEntry>>,
    config: GcConfig,
    last_gc: Mutex<Instant>,
    stats: GcStats,
}

impl GarbageCollector {
    /// Creates a new garbage collector.
    pub fn new(epoch_manager: Arc<EpochManager>) -> Self {
        Self::with_config(epoch_manager, GcConfig::default())
    }

    /// Creates a garbage collector with custom configuration.
    pub fn with_config(epoch_manager: Arc<EpochManager>, config: GcConfig) -> Self {
        Self {
            epoch_manager,
            garbage_queue: Mutex::new(VecDeque::new()),
            config,
            last_gc: Mutex::new(Instant::now()),
            stats: GcStats::new(),
        }
    }

    /// Retires unlinked chain tails at the current epoch.
    pub fn retire(&self, tails: Vec<Arc<Object>>) {
        if tails.is_empty() {
            return;
        }
        let version_count = tails.iter().map(|t| chain_len(t)).sum();
        let entry = GarbageEntry {
            retired_epoch: self.epoch_manager.current_epoch(),
            tails,
            version_count,
        };

        let mut queue = self.garbage_queue.lock();
        queue.push_back(entry);

        if queue.len() >= self.config.force_gc_threshold {
            drop(queue);
            self.collect();
        }
    }

    /// Runs a collection if the configured interval has passed.
    pub fn try_collect(&self) -> GcResult {
        let elapsed = self.last_gc.lock().elapsed();
        if elapsed < self.config.gc_interval {
            return GcResult {
                versions_collected: 0,
                chains_pruned: 0,
                skipped: true,
            };
        }

        self.collect()
    }

    /// Releases every retired tail whose epoch is safe.
    pub fn collect(&self) -> GcResult {
        *self.last_gc.lock() = Instant::now();

        let safe_epoch = self.epoch_manager.safe_epoch();
        let mut released = Vec::new();
        let mut versions_collected = 0;
        {
            let mut queue = self.garbage_queue.lock();
            while let Some(entry) = queue.front() {
                // Entries are queued in epoch order.
                if entry.retired_epoch > safe_epoch
                    || versions_collected >= self.config.max_versions_per_run
                {
                    break;
                }
                if let Some(entry) = queue.pop_front() {
                    versions_collected += entry.version_count;
                    released.push(entry);
                }
            }
        }

        let chains_pruned = released.iter().map(|e| e.tails.len()).sum();
        drop(released);

        self.stats.record_run(versions_collected, chains_pruned);
        if versions_collected > 0 {
            debug!(versions_collected, chains_pruned, %safe_epoch, "released old versions");
        }

        GcResult {
            versions_collected,
            chains_pruned,
            skipped: false,
        }
    }

    /// Returns GC statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Returns the number of pending garbage entries.
    pub fn pending_count(&self) -> usize {
        self.garbage_queue.lock().len()
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("pending_count", &self.pending_count())
            .field("total_runs", &self.stats.total_runs())
            .field("total_collected", &self.stats.total_versions_collected())
            .finish()
    }
}

fn chain_len(tail: &Arc<Object>) -> usize {
    let mut len = 1;
    let mut cur = tail.next();
    while let Some(obj) = cur {
        len += 1;
        cur = obj.next();
    }
    len
}

/// Result of a garbage collection run.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcResult {
    /// Number of versions released.
    pub versions_collected: usize,
    /// Number of chain tails released.
    pub chains_pruned: usize,
    /// Whether the run was skipped because the interval had not passed.
    pub skipped: bool,
}

impl GcResult {
    /// Returns true if any work was done.
    pub fn did_work(&self) -> bool {
        !self.skipped && (self.versions_collected > 0 || self.chains_pruned > 0)
    }
}
