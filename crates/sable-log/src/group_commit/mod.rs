//! Group commit implementation.
//!
//! Group commit batches multiple fsync calls together for better throughput.
//! Committers queue up behind the current flush; a background flusher wakes
//! every timeout and makes whatever has been filled durable. When the queue
//! reaches its configured length, the committer that filled it flushes
//! immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::alloc::LogAllocator;
use crate::config::{GroupCommitConfig, SyncPolicy};
use crate::error::LogResult;

/// Group commit manager.
///
/// Batches multiple sync requests and performs them together.
pub struct GroupCommitManager {
    /// Configuration.
    config: GroupCommitConfig,
    /// Whether committers flush on their own instead of batching.
    immediate: bool,
    /// Log space allocator that performs the flush.
    alloc: Arc<LogAllocator>,
    /// Number of committers waiting for durability.
    pending: Mutex<usize>,
    /// Condition variable for waiting on sync completion.
    sync_complete: Condvar,
    /// Wakes the background flusher.
    wake_flusher: Condvar,
    /// Whether shutdown has been requested.
    shutdown: AtomicBool,
    /// Completed group flushes.
    syncs: AtomicU64,
}

impl GroupCommitManager {
    /// Creates a new group commit manager.
    pub fn new(config: GroupCommitConfig, sync_policy: SyncPolicy, alloc: Arc<LogAllocator>) -> Self {
        Self {
            config,
            immediate: !config.enabled || sync_policy == SyncPolicy::EveryCommit,
            alloc,
            pending: Mutex::new(0),
            sync_complete: Condvar::new(),
            wake_flusher: Condvar::new(),
            shutdown: AtomicBool::new(false),
            syncs: AtomicU64::new(0),
        }
    }

    /// Blocks until every log byte before `offset` is durable.
    ///
    /// This will either:
    /// 1. Return immediately if the offset is already durable
    /// 2. Wait for the flusher to make it durable
    /// 3. Flush directly when the queue is full, batching is off, or the wait times out
    pub fn request_sync(&self, offset: u64) -> LogResult<()> {
        if self.is_synced(offset) {
            return Ok(());
        }

        let mut pending = self.pending.lock();
        *pending += 1;
        let mut flush_now = self.immediate || self.is_shutdown() || *pending >= self.config.queue_length;

        let result = loop {
            if flush_now {
                drop(pending);
                let synced = self.do_sync();
                pending = self.pending.lock();
                if let Err(e) = synced {
                    break Err(e);
                }
            }
            if self.is_synced(offset) {
                break Ok(());
            }
            if let Err(e) = self.alloc.check_failed() {
                break Err(e);
            }
            // Timeout - flush ourselves
            flush_now = self
                .sync_complete
                .wait_for(&mut pending, self.config.timeout * 2)
                .timed_out();
        };

        *pending -= 1;
        result
    }

    /// Flushes the log and wakes every waiting committer.
    pub fn do_sync(&self) -> LogResult<()> {
        let result = self.alloc.flush();
        let _pending = self.pending.lock();
        if result.is_ok() {
            self.syncs.fetch_add(1, Ordering::Relaxed);
        }
        self.sync_complete.notify_all();
        result.map(|_| ())
    }

    /// Forces an immediate flush of all pending writes.
    pub fn flush(&self) -> LogResult<()> {
        self.do_sync()
    }

    fn is_synced(&self, offset: u64) -> bool {
        offset <= self.alloc.durable_offset()
    }

    /// Returns the number of committers waiting for durability.
    pub fn pending_count(&self) -> usize {
        *self.pending.lock()
    }

    /// Returns the number of completed syncs.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Starts the background flusher thread.
    pub fn spawn_flusher(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let manager = Arc::clone(self);
        thread::Builder::new()
            .name("sable-log-flush".to_string())
            .spawn(move || manager.run_flusher())
    }

    fn run_flusher(&self) {
        debug!("log flusher started");
        loop {
            {
                let mut pending = self.pending.lock();
                if self.is_shutdown() {
                    break;
                }
                self.wake_flusher.wait_for(&mut pending, self.config.timeout);
                if self.is_shutdown() {
                    break;
                }
            }
            if self.alloc.has_unflushed() {
                if let Err(e) = self.do_sync() {
                    error!(error = %e, "log flusher stopping");
                    break;
                }
            }
        }
        debug!("log flusher stopped");
    }

    /// Stops the flusher without a final flush.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _pending = self.pending.lock();
        self.wake_flusher.notify_all();
    }

    /// Shuts down the group commit manager.
    pub fn shutdown(&self) -> LogResult<()> {
        self.stop();
        if self.alloc.is_failed() {
            return Ok(());
        }
        self.do_sync()
    }

    /// Returns true if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for GroupCommitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCommitManager")
            .field("durable", &self.alloc.durable_offset())
            .field("pending_count", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
