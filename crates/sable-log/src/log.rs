//! Main log manager.
//!
//! This module provides the `Log` struct that coordinates segments, the log
//! buffer, group commit, scanning and recovery.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use sable_common::{Lsn, TaggedPtr};

use crate::alloc::LogAllocator;
use crate::config::{LogConfig, SyncPolicy};
use crate::error::{LogError, LogResult};
use crate::group_commit::GroupCommitManager;
use crate::marks::{CheckpointMark, DurableMark};
use crate::recovery::{BackupFunctor, RecoveryFunctor, RecoveryReport};
use crate::scan::{BlockScanner, LogSource, ScanManager};
use crate::segment::SegmentTable;
use crate::staging::TxLog;
use crate::stats::{LogStats, LogStatsSnapshot};

/// State shared by the log, its transactions and its scanners.
pub(crate) struct LogShared {
    pub(crate) config: LogConfig,
    pub(crate) segments: Arc<SegmentTable>,
    pub(crate) alloc: Arc<LogAllocator>,
    pub(crate) stats: Arc<LogStats>,
}

impl LogShared {
    pub(crate) fn cur_lsn(&self) -> LogResult<Lsn> {
        self.segments.make_lsn(self.alloc.cur_offset())
    }

    pub(crate) fn durable_lsn(&self) -> LogResult<Lsn> {
        self.segments.make_lsn(self.alloc.durable_offset())
    }

    pub(crate) fn load_object(&self, ptr: TaggedPtr, align_bits: u8) -> LogResult<Bytes> {
        let lsn = ptr.as_lsn()?;
        let size = ptr.size(align_bits)?;
        let mut buf = vec![0u8; size];
        let got = self.read_log(lsn, &mut buf)?;
        if got < size {
            return Err(LogError::ShortRead {
                lsn,
                got,
                expected: size,
            });
        }
        Ok(Bytes::from(buf))
    }

    pub(crate) fn load_ext_pointer(&self, ptr: TaggedPtr) -> LogResult<TaggedPtr> {
        let slot = ptr.ext_slot()?;
        let raw = self.load_object(slot, 0)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&raw[..8]);
        Ok(TaggedPtr::from_u64(u64::from_be_bytes(word)))
    }
}

impl LogSource for LogShared {
    /// Reads stop at the durable end of the log.
    fn read_log(&self, lsn: Lsn, buf: &mut [u8]) -> LogResult<usize> {
        let durable = self.alloc.durable_offset();
        if lsn.offset() >= durable {
            return Ok(0);
        }
        let n = buf.len().min((durable - lsn.offset()) as usize);
        self.segments.read(lsn, &mut buf[..n])
    }

    fn verify_checksums(&self) -> bool {
        self.config.verify_checksums
    }
}

/// The log manager.
pub struct Log {
    shared: Arc<LogShared>,
    group: Arc<GroupCommitManager>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    checkpoint: Mutex<Option<CheckpointMark>>,
    backup: RwLock<Option<BackupFunctor>>,
    first_lsn: Lsn,
    needs_recovery: bool,
    closed: AtomicBool,
}

impl Log {
    /// Opens the log in `config.dir`, creating it if needed.
    ///
    /// Validates every block from the newest checkpoint (or the start of the
    /// log) onward, moves the durable mark to the end of the last valid block
    /// and discards everything after it. A corrupt block ends the log even
    /// when the mark says it was durable.
    pub fn open(config: LogConfig) -> LogResult<Self> {
        config.validate().map_err(LogError::config_error)?;

        if config.null_log_device && config.dir.exists() {
            warn!(dir = %config.dir.display(), "wiping log directory");
            for entry in fs::read_dir(&config.dir)? {
                let path = entry?.path();
                if path.is_file() {
                    fs::remove_file(path)?;
                }
            }
        }
        fs::create_dir_all(&config.dir)?;

        let segments = Arc::new(SegmentTable::open(&config.dir, config.segment_size as u64)?);
        let mark = DurableMark::load(&config.dir)?;
        let oldest = segments.oldest();
        let first_lsn = oldest.lsn(oldest.start());
        let start = CheckpointMark::find_newest(&config.dir, Lsn::MAX)?.map_or(first_lsn, |c| c.start);

        let (end, blocks) = Self::durable_walk(&segments, start)?;
        info!(
            segments = segments.len(),
            start = ?start,
            end = ?end,
            blocks,
            "log durable walk finished"
        );
        if let Some(durable) = mark.get().filter(|d| d.offset() > end.offset()) {
            warn!(?durable, ?end, "invalid block inside the durable log; truncating");
        }

        segments.truncate_after(end.offset())?;
        let end = segments.make_lsn(end.offset())?;
        mark.update(end)?;

        let checkpoint = CheckpointMark::find_newest(&config.dir, end)?;
        let needs_recovery = end.offset() > first_lsn.offset() || checkpoint.is_some();

        let stats = Arc::new(LogStats::new());
        let alloc = Arc::new(LogAllocator::new(
            &config,
            Arc::clone(&segments),
            mark,
            end.offset(),
            Arc::clone(&stats),
        ));
        let group = Arc::new(GroupCommitManager::new(
            config.group_commit,
            config.sync_policy,
            Arc::clone(&alloc),
        ));

        let flusher = if config.group_commit.enabled && config.sync_policy != SyncPolicy::EveryCommit {
            Some(group.spawn_flusher()?)
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(LogShared {
                config,
                segments,
                alloc,
                stats,
            }),
            group,
            flusher: Mutex::new(flusher),
            checkpoint: Mutex::new(checkpoint),
            backup: RwLock::new(None),
            first_lsn,
            needs_recovery,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the end of the last valid block reachable from `start`.
    fn durable_walk(segments: &SegmentTable, start: Lsn) -> LogResult<(Lsn, u64)> {
        let mut scan = BlockScanner::new(segments, start, false, true);
        let mut end = start;
        let mut blocks = 0;
        while let Some(block) = scan.block() {
            end = block.next_lsn();
            blocks += 1;
            scan.next();
        }
        match scan.take_error() {
            Some(e) => Err(e),
            None => Ok((end, blocks)),
        }
    }

    /// Starts staging a new transaction.
    pub fn new_tx_log(&self) -> TxLog {
        TxLog::new(Arc::clone(&self.shared))
    }

    /// Next LSN to be allocated.
    pub fn cur_lsn(&self) -> LogResult<Lsn> {
        self.shared.cur_lsn()
    }

    /// Everything before this LSN is durable.
    pub fn durable_flushed_lsn(&self) -> LogResult<Lsn> {
        self.shared.durable_lsn()
    }

    /// Blocks until everything before `lsn` is durable.
    pub fn wait_for_durable(&self, lsn: Lsn) -> LogResult<()> {
        self.check_open()?;
        self.group.request_sync(lsn.offset())
    }

    /// Makes everything filled so far durable and returns the durable LSN.
    pub fn flush(&self) -> LogResult<Lsn> {
        self.check_open()?;
        self.group.flush()?;
        self.durable_flushed_lsn()
    }

    /// Scan entry point.
    pub fn scan_manager(&self) -> ScanManager<'_> {
        ScanManager::new(&self.shared)
    }

    /// Reads the object a log pointer refers to.
    pub fn load_object(&self, ptr: TaggedPtr, align_bits: u8) -> LogResult<Bytes> {
        self.shared.load_object(ptr, align_bits)
    }

    /// Resolves an external pointer.
    pub fn load_ext_pointer(&self, ptr: TaggedPtr) -> LogResult<TaggedPtr> {
        self.shared.load_ext_pointer(ptr)
    }

    /// Returns true if the log held any durable content at open.
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    /// LSN of the first byte of the log.
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// Replays the durable log after the newest checkpoint through `functor`.
    ///
    /// Restoring the checkpoint itself is the caller's job; see
    /// [`checkpoint_mark`](Self::checkpoint_mark).
    pub fn recover<C, F>(&self, ctx: &C, functor: &F) -> LogResult<RecoveryReport>
    where
        C: ?Sized,
        F: RecoveryFunctor<C> + ?Sized,
    {
        let checkpoint = self.checkpoint_mark();
        let start = checkpoint.map_or(self.first_lsn, |c| c.start);
        let end = self.durable_flushed_lsn()?;

        info!(
            ?start,
            ?end,
            checkpoint = checkpoint.is_some(),
            policy = ?self.shared.config.replay_policy,
            "log recovery starting"
        );
        self.redo_log(ctx, functor, start, end)?;
        info!(?end, "log recovery finished");

        Ok(RecoveryReport {
            start,
            end,
            from_checkpoint: checkpoint.is_some(),
        })
    }

    /// Replays `[start, end)` through `functor`. A functor error is fatal.
    pub fn redo_log<C, F>(&self, ctx: &C, functor: &F, start: Lsn, end: Lsn) -> LogResult<()>
    where
        C: ?Sized,
        F: RecoveryFunctor<C> + ?Sized,
    {
        if start.offset() >= end.offset() {
            return Ok(());
        }
        functor
            .replay(ctx, &self.scan_manager(), start, end)
            .map_err(|source| LogError::replay_failed(start, end, source))
    }

    /// The newest complete checkpoint.
    pub fn checkpoint_mark(&self) -> Option<CheckpointMark> {
        *self.checkpoint.lock()
    }

    /// Path of the data file for a checkpoint starting at `start`.
    pub fn checkpoint_data_path(&self, start: Lsn) -> PathBuf {
        self.shared.config.dir.join(CheckpointMark::data_file_name(start))
    }

    /// Records a finished checkpoint. The data file must already be synced.
    pub fn update_checkpoint_mark(&self, start: Lsn, end: Lsn) -> LogResult<()> {
        let mark = CheckpointMark { start, end };
        mark.persist(&self.shared.config.dir)?;
        *self.checkpoint.lock() = Some(mark);
        info!(?start, ?end, "checkpoint marker written");
        Ok(())
    }

    /// Durable bytes `[begin, end)`, for shipping to a backup.
    pub fn ship_range(&self, begin: Lsn, end: Lsn) -> LogResult<Bytes> {
        let len = end.offset().saturating_sub(begin.offset()) as usize;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let at = self.shared.segments.make_lsn(begin.offset() + filled as u64)?;
            let n = self.shared.read_log(at, &mut buf[filled..])?;
            if n == 0 {
                return Err(LogError::ShortRead {
                    lsn: at,
                    got: filled,
                    expected: len,
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }

    /// Appends log bytes shipped from a primary and makes them durable.
    ///
    /// Returns the new durable LSN.
    pub fn apply_shipped(&self, start: Lsn, bytes: &[u8]) -> LogResult<Lsn> {
        self.check_open()?;
        self.shared.alloc.append_raw(start.offset(), bytes)?;
        self.flush()
    }

    /// Registers the functor used by [`backup_redo_log`](Self::backup_redo_log).
    pub fn set_backup_functor(&self, functor: BackupFunctor) {
        *self.backup.write() = Some(functor);
    }

    /// Replays shipped log `[start, end)` through the backup functor.
    pub fn backup_redo_log(&self, start: Lsn, end: Lsn) -> LogResult<()> {
        let backup = self.backup.read();
        let functor = backup.as_ref().ok_or(LogError::NoBackupFunctor)?;
        if start.offset() >= end.offset() {
            return Ok(());
        }
        functor(&self.scan_manager(), start, end)
            .map_err(|source| LogError::replay_failed(start, end, source))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LogConfig {
        &self.shared.config
    }

    /// Returns a snapshot of the log counters.
    pub fn stats(&self) -> LogStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Returns true if the log is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> LogResult<()> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        self.shared.alloc.check_failed()
    }

    /// Flushes everything and stops the flusher.
    pub fn close(&self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.group.shutdown();
        self.join_flusher();
        result
    }

    /// Stops the flusher without flushing; unflushed bytes are lost as in a crash.
    pub fn halt(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.group.stop();
        self.join_flusher();
    }

    fn join_flusher(&self) {
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                warn!("log flusher thread panicked");
            }
        }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "log close failed");
        }
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("dir", &self.shared.config.dir)
            .field("segments", &self.shared.segments)
            .field("alloc", &self.shared.alloc)
            .field("checkpoint", &self.checkpoint_mark())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RecordType;
    use crate::config::GroupCommitConfig;
    use crate::error::ReplayError;
    use crate::segment::Segment;
    use crate::staging::CommitRecord;
    use sable_common::constants::{DEFAULT_ALIGNMENT_BITS, MIN_LOG_SEGMENT_SIZE};
    use sable_common::{Fid, Oid};
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;
    use tempfile::TempDir;

    const KIB: usize = 1024;

    fn test_config(dir: &Path) -> LogConfig {
        LogConfig::for_testing(dir).with_group_commit(GroupCommitConfig {
            enabled: false,
            ..GroupCommitConfig::default()
        })
    }

    fn filled(len: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    fn commit_insert(log: &Log, oid: u32, payload: &[u8]) -> CommitRecord {
        let mut tx = log.new_tx_log();
        tx.log_insert(Fid::new(3), Oid::new(oid), Bytes::copy_from_slice(payload), 0)
            .unwrap();
        tx.commit().unwrap()
    }

    fn collect_oids(
        seen: &Mutex<Vec<u32>>,
        scanner: &ScanManager<'_>,
        start: Lsn,
        end: Lsn,
    ) -> Result<(), ReplayError> {
        let mut scan = scanner.new_record_scan(start);
        while scan.valid() && scan.block_lsn().offset() < end.offset() {
            seen.lock().push(scan.oid().as_u32());
            scan.next();
        }
        match scan.take_error() {
            Some(e) => Err(Box::new(e)),
            None => Ok(()),
        }
    }

    fn record_oids(log: &Log, start: Lsn) -> Vec<u32> {
        let seen = Mutex::new(Vec::new());
        collect_oids(&seen, &log.scan_manager(), start, log.cur_lsn().unwrap()).unwrap();
        seen.into_inner()
    }

    fn first_segment_path(dir: &Path) -> PathBuf {
        dir.join(Segment::file_name(1, 0, MIN_LOG_SEGMENT_SIZE as u64))
    }

    #[test]
    fn test_log_creation() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();

        assert!(!log.is_closed());
        assert!(!log.needs_recovery());
        assert_eq!(log.first_lsn(), Lsn::make(0, 1));
        assert_eq!(log.cur_lsn().unwrap(), log.first_lsn());
        assert_eq!(log.durable_flushed_lsn().unwrap(), log.first_lsn());
        assert!(first_segment_path(tmp.path()).exists());
    }

    #[test]
    fn test_commit_is_durable_after_wait() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();

        let rec = commit_insert(&log, 1, b"hello");
        assert!(rec.block_lsn.is_valid());
        assert!(rec.commit_lsn.offset() > rec.block_lsn.offset());
        assert_eq!(log.durable_flushed_lsn().unwrap(), log.first_lsn());

        log.wait_for_durable(rec.commit_lsn).unwrap();
        assert_eq!(log.durable_flushed_lsn().unwrap(), rec.commit_lsn);

        let mut scan = log.scan_manager().new_record_scan(log.first_lsn());
        assert!(scan.valid());
        assert_eq!(scan.record_type(), Some(RecordType::Insert));
        assert_eq!(scan.oid(), Oid::new(1));
        assert_eq!(scan.payload().unwrap(), Bytes::from_static(b"hello"));
        scan.next();
        assert!(!scan.valid());
    }

    #[test]
    fn test_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let end = {
            let log = Log::open(config.clone()).unwrap();
            commit_insert(&log, 1, b"one");
            let rec = commit_insert(&log, 2, b"two");
            log.close().unwrap();
            rec.commit_lsn
        };

        let log = Log::open(config).unwrap();
        assert!(log.needs_recovery());
        assert_eq!(log.durable_flushed_lsn().unwrap(), end);
        assert_eq!(log.cur_lsn().unwrap(), end);
        assert_eq!(record_oids(&log, log.first_lsn()), vec![1, 2]);

        let rec = commit_insert(&log, 3, b"three");
        assert_eq!(rec.block_lsn, end);
    }

    #[test]
    fn test_unflushed_tail_is_lost() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let durable = {
            let log = Log::open(config.clone()).unwrap();
            let rec = commit_insert(&log, 1, b"kept");
            log.wait_for_durable(rec.commit_lsn).unwrap();
            commit_insert(&log, 2, b"lost");
            log.halt();
            rec.commit_lsn
        };

        let log = Log::open(config).unwrap();
        assert_eq!(log.durable_flushed_lsn().unwrap(), durable);
        assert_eq!(record_oids(&log, log.first_lsn()), vec![1]);
    }

    #[test]
    fn test_walk_past_lagging_mark() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let (first, second) = {
            let log = Log::open(config.clone()).unwrap();
            let a = commit_insert(&log, 1, b"a");
            let b = commit_insert(&log, 2, b"b");
            log.close().unwrap();
            (a, b)
        };

        // The mark trails the data, as after a crash between write and rename.
        fs::rename(
            tmp.path().join(DurableMark::file_name(second.commit_lsn)),
            tmp.path().join(DurableMark::file_name(first.commit_lsn)),
        )
        .unwrap();

        let log = Log::open(config).unwrap();
        assert_eq!(log.durable_flushed_lsn().unwrap(), second.commit_lsn);
    }

    #[test]
    fn test_torn_block_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let (first, second) = {
            let log = Log::open(config.clone()).unwrap();
            let a = commit_insert(&log, 1, b"a");
            let b = commit_insert(&log, 2, b"b");
            log.close().unwrap();
            (a, b)
        };

        fs::rename(
            tmp.path().join(DurableMark::file_name(second.commit_lsn)),
            tmp.path().join(DurableMark::file_name(first.commit_lsn)),
        )
        .unwrap();

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(first_segment_path(tmp.path()))
            .unwrap();
        file.seek(SeekFrom::Start(second.block_lsn.offset() + 30)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let log = Log::open(config).unwrap();
        assert_eq!(log.durable_flushed_lsn().unwrap(), first.commit_lsn);
        assert_eq!(
            fs::metadata(first_segment_path(tmp.path())).unwrap().len(),
            first.commit_lsn.offset()
        );
        assert_eq!(record_oids(&log, log.first_lsn()), vec![1]);
    }

    #[test]
    fn test_corrupt_block_below_durable_mark_ends_log() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let recs = {
            let log = Log::open(config.clone()).unwrap();
            let recs: Vec<_> = (1..=4u32).map(|oid| commit_insert(&log, oid, &[oid as u8; 40])).collect();
            log.close().unwrap();
            recs
        };
        let mark = tmp.path().join(DurableMark::file_name(recs[3].commit_lsn));
        assert!(mark.exists());

        // Flip a payload byte of the third block; the mark still covers it.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(first_segment_path(tmp.path()))
            .unwrap();
        file.seek(SeekFrom::Start(recs[2].block_lsn.offset() + 52)).unwrap();
        file.write_all(&[0xee]).unwrap();
        drop(file);

        let log = Log::open(config).unwrap();
        assert_eq!(log.durable_flushed_lsn().unwrap(), recs[1].commit_lsn);
        assert_eq!(record_oids(&log, log.first_lsn()), vec![1, 2]);
        assert!(!mark.exists());
        assert!(tmp.path().join(DurableMark::file_name(recs[1].commit_lsn)).exists());
    }

    #[test]
    fn test_empty_transaction_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();
        commit_insert(&log, 1, b"x");

        let before = log.cur_lsn().unwrap();
        let rec = log.new_tx_log().commit().unwrap();
        assert_eq!(rec.block_lsn, Lsn::INVALID);
        assert_eq!(rec.commit_lsn, before);
        assert_eq!(log.cur_lsn().unwrap(), before);
    }

    #[test]
    fn test_discarded_transaction_is_invisible() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();

        let mut doomed = log.new_tx_log();
        doomed
            .log_insert(Fid::new(3), Oid::new(1), Bytes::from_static(b"gone"), 0)
            .unwrap();
        doomed.pre_commit().unwrap();
        assert!(doomed.commit_block_lsn().is_some());
        doomed.discard().unwrap();

        let rec = commit_insert(&log, 7, b"seven");
        log.wait_for_durable(rec.commit_lsn).unwrap();

        assert_eq!(record_oids(&log, log.first_lsn()), vec![7]);
        assert_eq!(log.stats().discards, 1);
    }

    #[test]
    fn test_request_after_pre_commit_rejected() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();

        let mut tx = log.new_tx_log();
        tx.log_delete(Fid::new(3), Oid::new(1)).unwrap();
        let clsn = tx.pre_commit().unwrap();
        assert_eq!(tx.pre_commit().unwrap(), clsn);
        assert!(tx.log_delete(Fid::new(3), Oid::new(2)).is_err());
        assert_eq!(tx.commit().unwrap().commit_lsn, clsn);
    }

    #[test]
    fn test_large_transaction_spills() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();

        let mut tx = log.new_tx_log();
        let mut ids = Vec::new();
        for oid in 0..8u32 {
            let payload = filled(96 * KIB, oid as u8);
            ids.push(
                tx.log_insert(Fid::new(3), Oid::new(oid), payload, DEFAULT_ALIGNMENT_BITS)
                    .unwrap(),
            );
        }
        assert!(tx.has_overflow());
        let spilled = tx.payload_ptr(ids[0]).unwrap();
        let rec = tx.commit().unwrap();
        let after = commit_insert(&log, 100, b"next");
        log.wait_for_durable(after.commit_lsn).unwrap();

        assert_eq!(log.stats().overflow_blocks, 1);
        assert_eq!(
            log.load_object(spilled, DEFAULT_ALIGNMENT_BITS).unwrap(),
            filled(96 * KIB, 0)
        );

        let mut scan = log.scan_manager().new_tx_scan(rec.block_lsn);
        let mut oids = Vec::new();
        assert!(scan.in_overflow_block());
        while scan.valid() {
            if !scan.in_overflow_block() {
                assert_eq!(scan.block_next_lsn(), rec.commit_lsn);
            }
            assert_eq!(scan.payload_size().unwrap(), 96 * KIB);
            assert_eq!(scan.load_object().unwrap(), filled(96 * KIB, scan.oid().as_u32() as u8));
            oids.push(scan.oid().as_u32());
            scan.next();
        }
        assert_eq!(oids, (0..8).collect::<Vec<_>>());

        // Sequential scans reach spilled blocks only through their commit block.
        let mut all = (0..8).collect::<Vec<_>>();
        all.push(100);
        assert_eq!(record_oids(&log, log.first_lsn()), all);
    }

    #[test]
    fn test_external_payload() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();

        let big = filled(256 * KIB, 0x5a);
        let mut tx = log.new_tx_log();
        let id = tx
            .log_update(Fid::new(3), Oid::new(4), big.clone(), DEFAULT_ALIGNMENT_BITS)
            .unwrap();
        let target = tx.payload_ptr(id).unwrap();
        let rec = tx.commit().unwrap();
        log.wait_for_durable(rec.commit_lsn).unwrap();

        let scans = log.scan_manager();
        let mut scan = scans.new_record_scan(log.first_lsn());
        assert!(scan.valid());
        assert_eq!(scan.record_type(), Some(RecordType::UpdateExt));
        assert!(scan.is_ext());
        assert_eq!(scan.payload_ptr(true).unwrap(), target);

        let ext = scan.payload_ptr(false).unwrap();
        assert_eq!(log.load_ext_pointer(ext).unwrap(), target);
        assert_eq!(scan.load_object().unwrap(), big);

        let mut headers = scans.new_header_scan(log.first_lsn());
        assert!(headers.valid());
        assert_eq!(headers.load_object().unwrap(), big);
        headers.next();
        assert!(!headers.valid());
    }

    #[test]
    fn test_segment_rollover() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let end = {
            let log = Log::open(config.clone()).unwrap();
            let mut last = None;
            for oid in 0..12u32 {
                let mut tx = log.new_tx_log();
                tx.log_insert(Fid::new(3), Oid::new(oid), filled(96 * KIB, 1), DEFAULT_ALIGNMENT_BITS)
                    .unwrap();
                last = Some(tx.commit().unwrap());
            }
            let last = last.unwrap();
            log.wait_for_durable(last.commit_lsn).unwrap();
            assert!(log.stats().segments_created >= 1);
            assert_eq!(last.commit_lsn.segment(), 2);
            assert_eq!(record_oids(&log, log.first_lsn()), (0..12).collect::<Vec<_>>());
            log.close().unwrap();
            last.commit_lsn
        };

        let log = Log::open(config).unwrap();
        assert_eq!(log.durable_flushed_lsn().unwrap(), end);
        assert_eq!(record_oids(&log, log.first_lsn()).len(), 12);
    }

    #[test]
    fn test_recover_with_functor() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        {
            let log = Log::open(config.clone()).unwrap();
            for oid in [5, 6, 7] {
                commit_insert(&log, oid, b"v");
            }
            log.close().unwrap();
        }

        let log = Log::open(config).unwrap();
        let seen = Mutex::new(Vec::new());
        let report = log.recover(&seen, &collect_oids).unwrap();
        assert!(!report.from_checkpoint);
        assert_eq!(report.start, log.first_lsn());
        assert_eq!(report.end, log.durable_flushed_lsn().unwrap());
        assert_eq!(seen.into_inner(), vec![5, 6, 7]);
    }

    #[test]
    fn test_replay_failure_is_fatal() {
        fn failing(_: &(), _: &ScanManager<'_>, _: Lsn, _: Lsn) -> Result<(), ReplayError> {
            Err("bad record".into())
        }

        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();
        let rec = commit_insert(&log, 1, b"x");
        log.wait_for_durable(rec.commit_lsn).unwrap();

        let err = log.recover(&(), &failing).unwrap_err();
        assert!(matches!(err, LogError::ReplayFailed { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_recover_from_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        let start = {
            let log = Log::open(config.clone()).unwrap();
            commit_insert(&log, 1, b"before");
            let start = log.flush().unwrap();
            fs::write(log.checkpoint_data_path(start), b"image").unwrap();
            log.update_checkpoint_mark(start, start).unwrap();
            commit_insert(&log, 2, b"after");
            log.close().unwrap();
            start
        };

        let log = Log::open(config).unwrap();
        assert_eq!(
            log.checkpoint_mark(),
            Some(CheckpointMark { start, end: start })
        );

        let seen = Mutex::new(Vec::new());
        let report = log.recover(&seen, &collect_oids).unwrap();
        assert!(report.from_checkpoint);
        assert_eq!(report.start, start);
        assert_eq!(seen.into_inner(), vec![2]);
    }

    #[test]
    fn test_ship_to_backup() {
        let primary_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        let primary = Log::open(test_config(primary_dir.path())).unwrap();
        let backup = Log::open(test_config(backup_dir.path())).unwrap();

        commit_insert(&primary, 1, b"first");
        commit_insert(&primary, 2, b"second");
        let end = primary.flush().unwrap();
        let shipped = primary.ship_range(primary.first_lsn(), end).unwrap();

        assert!(matches!(
            backup.backup_redo_log(backup.first_lsn(), end),
            Err(LogError::NoBackupFunctor)
        ));

        let durable = backup.apply_shipped(backup.first_lsn(), &shipped).unwrap();
        assert_eq!(durable, end);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        backup.set_backup_functor(Box::new(move |scanner: &ScanManager<'_>, start: Lsn, end: Lsn| {
            collect_oids(&sink, scanner, start, end)
        }));
        backup.backup_redo_log(backup.first_lsn(), durable).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);

        // Shipping must continue exactly where the backup ends.
        let err = backup.apply_shipped(backup.first_lsn(), &shipped).unwrap_err();
        assert!(matches!(err, LogError::NotContiguous { .. }));
    }

    #[test]
    fn test_null_log_device_wipes() {
        let tmp = TempDir::new().unwrap();
        {
            let log = Log::open(test_config(tmp.path())).unwrap();
            commit_insert(&log, 1, b"x");
            log.close().unwrap();
        }

        let log = Log::open(test_config(tmp.path()).with_null_log_device(true)).unwrap();
        assert!(!log.needs_recovery());
        assert_eq!(log.durable_flushed_lsn().unwrap(), log.first_lsn());
    }

    #[test]
    fn test_closed_log_rejects_flush() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(test_config(tmp.path())).unwrap();
        log.close().unwrap();
        assert!(log.is_closed());
        assert!(matches!(log.flush(), Err(LogError::Closed)));
    }

    #[test]
    fn test_background_flusher() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(LogConfig::for_testing(tmp.path())).unwrap();

        let rec = commit_insert(&log, 1, b"x");
        log.wait_for_durable(rec.commit_lsn).unwrap();
        assert!(log.durable_flushed_lsn().unwrap().offset() >= rec.commit_lsn.offset());
    }
}
