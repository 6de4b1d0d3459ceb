//! The storage engine: log, OID arrays, transactions, checkpoints and GC.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use sable_common::{AddressSpace, Fid, Lsn, Oid, TaggedPtr, Xid};
use sable_log::{Log, LogError, RecoveryReport};

use crate::checkpoint::{restore_checkpoint, write_checkpoint, CheckpointFile, CheckpointSummary};
use crate::config::EngineConfig;
use crate::error::{OidError, OidResult};
use crate::gc::{EpochManager, GarbageCollector, GcResult};
use crate::manager::OidManager;
use crate::object::PayloadSource;
use crate::replay::OidReplay;
use crate::snapshot::Snapshot;
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::txn::Transaction;

/// Resolves stored versions against the log and the live checkpoint.
pub struct Storage {
    log: Arc<Log>,
    checkpoint: ArcSwapOption<CheckpointFile>,
    stats: Arc<EngineStats>,
}

impl Storage {
    fn new(log: Arc<Log>, stats: Arc<EngineStats>) -> Self {
        Self {
            log,
            checkpoint: ArcSwapOption::from(None),
            stats,
        }
    }

    /// The checkpoint file loads are served from, if any.
    pub fn checkpoint(&self) -> Option<Arc<CheckpointFile>> {
        self.checkpoint.load_full()
    }
}

impl PayloadSource for Storage {
    fn load(&self, ptr: TaggedPtr, align_bits: u8) -> OidResult<Bytes> {
        let bytes = match ptr.space() {
            Some(AddressSpace::Log) => self.log.load_object(ptr, align_bits)?,
            Some(AddressSpace::Checkpoint) => match self.checkpoint.load_full() {
                Some(file) => file.load(ptr, align_bits)?,
                None => return Err(OidError::invariant("checkpoint pointer without a checkpoint file")),
            },
            other => return Err(OidError::invariant(format!("cannot load a version from {other:?}"))),
        };
        EngineStats::bump(&self.stats.pins);
        Ok(bytes)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("checkpoint", &self.checkpoint.load().as_ref().map(|c| c.start()))
            .finish()
    }
}

/// State shared by the engine and its transactions.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) log: Arc<Log>,
    pub(crate) oids: Arc<OidManager>,
    pub(crate) storage: Storage,
    pub(crate) epochs: Arc<EpochManager>,
    pub(crate) gc: GarbageCollector,
    /// Begin LSNs of running transactions.
    pub(crate) active: DashMap<Xid, Lsn>,
    /// Held shared while a transaction takes its snapshot, exclusively while GC picks its horizon.
    pub(crate) begin_gate: RwLock<()>,
    pub(crate) stats: Arc<EngineStats>,
    next_xid: AtomicU64,
    catalog_lock: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    closed: AtomicBool,
}

/// An open storage engine.
///
/// Dropping the engine closes it.
pub struct Engine {
    shared: Arc<EngineShared>,
    recovery: RecoveryReport,
}

impl Engine {
    /// Opens the engine in `config.log.dir`, recovering whatever is there.
    ///
    /// The newest checkpoint is restored first, then the log after it is
    /// replayed and OID allocators are rebuilt from the occupied slots.
    pub fn open(config: EngineConfig) -> OidResult<Self> {
        config.validate().map_err(OidError::config_error)?;

        let log = Arc::new(Log::open(config.log.clone())?);
        let stats = Arc::new(EngineStats::new());
        let oids = Arc::new(OidManager::new(config.max_oids_per_file));
        let storage = Storage::new(Arc::clone(&log), Arc::clone(&stats));

        if let Some(mark) = log.checkpoint_mark() {
            let path = log.checkpoint_data_path(mark.start);
            let (file, summary) = restore_checkpoint(&path, mark.start, &oids)?;
            info!(
                start = ?mark.start,
                files = summary.files,
                entries = summary.entries,
                "checkpoint restored"
            );
            storage.checkpoint.store(Some(Arc::new(file)));
        }

        let recovery = log.recover(oids.as_ref(), &OidReplay)?;
        oids.recreate_allocators()?;
        info!(
            start = ?recovery.start,
            end = ?recovery.end,
            from_checkpoint = recovery.from_checkpoint,
            files = oids.file_ids().len(),
            "engine opened"
        );

        let epochs = Arc::new(EpochManager::with_config(config.epoch.clone()));
        let gc = GarbageCollector::with_config(Arc::clone(&epochs), config.gc.clone());
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                log,
                oids,
                storage,
                epochs,
                gc,
                active: DashMap::new(),
                begin_gate: RwLock::new(()),
                stats,
                next_xid: AtomicU64::new(1),
                catalog_lock: Mutex::new(()),
                checkpoint_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
            recovery,
        })
    }

    fn check_open(&self) -> OidResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed.into());
        }
        Ok(())
    }

    /// Starts a transaction.
    pub fn begin(&self) -> OidResult<Transaction> {
        self.check_open()?;
        let xid = Xid::new(self.shared.next_xid.fetch_add(1, Ordering::Relaxed));
        Transaction::begin(Arc::clone(&self.shared), xid)
    }

    /// Creates a named table and returns its file id.
    ///
    /// The name is logged and durable before this returns.
    pub fn create_table(&self, name: &str) -> OidResult<Fid> {
        self.check_open()?;
        let _catalog = self.shared.catalog_lock.lock();
        if let Some(fid) = self.shared.oids.find_file(name) {
            return Err(OidError::FileExists(fid));
        }

        let fid = self.shared.oids.create_file(true)?;
        let logged = (|| {
            let mut txlog = self.shared.log.new_tx_log();
            txlog.log_table(fid, name)?;
            let rec = txlog.commit()?;
            self.shared.log.wait_for_durable(rec.commit_lsn)?;
            Ok::<_, LogError>(rec.commit_lsn)
        })();
        let clsn = match logged {
            Ok(clsn) => clsn,
            Err(e) => {
                self.shared.oids.destroy_file(fid)?;
                return Err(e.into());
            }
        };

        self.shared.oids.set_file_name(fid, name, clsn)?;
        info!(?fid, name, "table created");
        Ok(fid)
    }

    /// Looks a table up by name.
    pub fn table(&self, name: &str) -> Option<Fid> {
        self.shared.oids.find_file(name)
    }

    /// Reads the newest committed version of a record.
    pub fn read_latest(&self, fid: Fid, oid: Oid) -> OidResult<Option<Bytes>> {
        self.check_open()?;
        let _guard = self.shared.epochs.pin();
        let snapshot = Snapshot::at(Lsn::MAX);
        match self.shared.oids.get_version(fid, oid, &snapshot)? {
            Some(obj) => obj.data(&self.shared.storage),
            None => Ok(None),
        }
    }

    /// Writes a checkpoint of every committed version as of the durable end of the log.
    ///
    /// Returns `None` if nothing was committed since the last checkpoint.
    pub fn checkpoint(&self) -> OidResult<Option<CheckpointSummary>> {
        self.check_open()?;
        let _running = self.shared.checkpoint_lock.lock();
        let log = &self.shared.log;

        let start = log.flush()?;
        if log.checkpoint_mark().is_some_and(|mark| mark.start == start) {
            debug!(?start, "no new commits since the last checkpoint");
            return Ok(None);
        }

        let path = log.checkpoint_data_path(start);
        let summary = {
            let _guard = self.shared.epochs.pin();
            write_checkpoint(&path, &self.shared.oids, start, &self.shared.storage)?
        };
        let opened = CheckpointFile::open(&path, start)?;
        let end = log.cur_lsn()?;
        if let Err(e) = log.update_checkpoint_mark(start, end) {
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "could not remove unused checkpoint data");
            }
            return Err(e.into());
        }
        self.shared.storage.checkpoint.store(Some(Arc::new(opened)));

        EngineStats::bump(&self.shared.stats.checkpoints);
        info!(?start, entries = summary.entries, bytes = summary.bytes, "checkpoint finished");
        Ok(Some(summary))
    }

    /// Oldest snapshot any running transaction may still read from.
    fn oldest_snapshot(&self) -> OidResult<Lsn> {
        let _gate = self.shared.begin_gate.write();
        let oldest = self
            .shared
            .active
            .iter()
            .map(|entry| *entry.value())
            .min_by_key(|lsn| lsn.offset());
        match oldest {
            Some(lsn) => Ok(lsn),
            None => Ok(self.shared.log.cur_lsn()?),
        }
    }

    /// Unlinks versions no running transaction can see and releases those
    /// no reader can still reach.
    pub fn collect_garbage(&self) -> OidResult<GcResult> {
        self.check_open()?;
        let oldest = self.oldest_snapshot()?;
        let tails = self.shared.oids.prune(oldest);
        let pruned = tails.len();
        self.shared.gc.retire(tails);

        self.shared.epochs.advance_epoch();
        let result = self.shared.gc.collect();
        EngineStats::add(&self.shared.stats.versions_reclaimed, result.versions_collected as u64);
        debug!(?oldest, pruned, collected = result.versions_collected, "garbage collection pass");
        Ok(result)
    }

    /// Blocks until everything committed so far is durable.
    pub fn flush(&self) -> OidResult<Lsn> {
        self.check_open()?;
        Ok(self.shared.log.flush()?)
    }

    /// What recovery did at open.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<Log> {
        &self.shared.log
    }

    /// The OID arrays.
    pub fn oids(&self) -> &Arc<OidManager> {
        &self.shared.oids
    }

    /// Where stored versions are loaded from.
    pub fn storage(&self) -> &Storage {
        &self.shared.storage
    }

    /// Number of running transactions.
    pub fn active_transactions(&self) -> usize {
        self.shared.active.len()
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Returns true once the engine is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Flushes the log and closes the engine, checkpointing first if configured.
    pub fn close(&self) -> OidResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.shared.config.checkpoint_on_close {
            self.checkpoint()?;
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.log.close()?;
        info!(active = self.shared.active.len(), "engine closed");
        Ok(())
    }

    /// Stops without flushing; unflushed commits are lost as in a crash.
    pub fn halt(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.log.halt();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "engine close on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.shared.config.log.dir)
            .field("files", &self.shared.oids.file_ids().len())
            .field("active", &self.shared.active.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Engine {
        Engine::open(EngineConfig::for_testing(dir.path())).unwrap()
    }

    #[test]
    fn test_insert_read_after_commit() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("items").unwrap();

        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(txn.read(fid, oid).unwrap().as_deref(), Some(&b"hello"[..]));
        let clsn = txn.commit().unwrap();
        assert!(clsn.is_valid());

        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"hello"[..]));
        let stats = engine.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(engine.active_transactions(), 0);
    }

    #[test]
    fn test_published_commit_survives_failed_durability_wait() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("items").unwrap();

        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"kept")).unwrap();
        // The log stops accepting durability waits but the block can still be published.
        engine.log().halt();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, OidError::NotDurable { source: LogError::Closed, .. }));
        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"kept"[..]));
        let obj = engine.oids().latest_object(fid, oid).unwrap().unwrap();
        assert!(obj.clsn().is_some());
        assert_eq!(engine.active_transactions(), 0);
        let stats = engine.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts, 0);
    }

    #[test]
    fn test_empty_record_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("items").unwrap();

        let mut txn = engine.begin().unwrap();
        assert!(matches!(txn.insert(fid, Bytes::new()), Err(OidError::EmptyPayload { .. })));
        let oid = txn.insert(fid, Bytes::from_static(b"x")).unwrap();
        assert!(matches!(txn.update(fid, oid, Bytes::new()), Err(OidError::EmptyPayload { .. })));
        assert_eq!(txn.write_count(), 1);
        txn.commit().unwrap();
        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("items").unwrap();
        assert!(matches!(engine.create_table("items"), Err(OidError::FileExists(f)) if f == fid));
        assert_eq!(engine.table("items"), Some(fid));
        assert_eq!(engine.table("missing"), None);
    }

    #[test]
    fn test_snapshot_does_not_see_later_commit() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();

        let mut setup = engine.begin().unwrap();
        let oid = setup.insert(fid, Bytes::from_static(b"v1")).unwrap();
        setup.commit().unwrap();

        let reader = engine.begin().unwrap();
        let mut writer = engine.begin().unwrap();
        writer.update(fid, oid, Bytes::from_static(b"v2")).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.read(fid, oid).unwrap().as_deref(), Some(&b"v1"[..]));
        let fresh = engine.begin().unwrap();
        assert_eq!(fresh.read(fid, oid).unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn test_write_conflict() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();

        let mut setup = engine.begin().unwrap();
        let oid = setup.insert(fid, Bytes::from_static(b"v1")).unwrap();
        setup.commit().unwrap();

        let mut first = engine.begin().unwrap();
        let mut second = engine.begin().unwrap();
        first.update(fid, oid, Bytes::from_static(b"a")).unwrap();
        let err = second.update(fid, oid, Bytes::from_static(b"b")).unwrap_err();
        assert!(err.is_conflict());
        first.commit().unwrap();
        second.abort().unwrap();

        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(engine.stats().conflicts, 1);
    }

    #[test]
    fn test_abort_undoes_writes() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();

        let mut setup = engine.begin().unwrap();
        let kept = setup.insert(fid, Bytes::from_static(b"keep")).unwrap();
        setup.commit().unwrap();

        let mut txn = engine.begin().unwrap();
        let temp = txn.insert(fid, Bytes::from_static(b"temp")).unwrap();
        txn.update(fid, kept, Bytes::from_static(b"changed")).unwrap();
        txn.abort().unwrap();

        assert_eq!(engine.read_latest(fid, temp).unwrap(), None);
        assert_eq!(engine.read_latest(fid, kept).unwrap().as_deref(), Some(&b"keep"[..]));

        // The freed OID is handed out again.
        let mut again = engine.begin().unwrap();
        assert_eq!(again.insert(fid, Bytes::from_static(b"x")).unwrap(), temp);
        again.commit().unwrap();
    }

    #[test]
    fn test_dropped_transaction_aborts() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();
        let oid = {
            let mut txn = engine.begin().unwrap();
            txn.insert(fid, Bytes::from_static(b"gone")).unwrap()
        };
        assert_eq!(engine.read_latest(fid, oid).unwrap(), None);
        assert_eq!(engine.stats().aborts, 1);
        assert_eq!(engine.active_transactions(), 0);
    }

    #[test]
    fn test_update_twice_in_one_transaction() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();

        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"a")).unwrap();
        txn.update(fid, oid, Bytes::from_static(b"b")).unwrap();
        txn.update(fid, oid, Bytes::from_static(b"c")).unwrap();
        assert_eq!(txn.write_count(), 1);
        txn.commit().unwrap();

        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"c"[..]));
        let head = engine.oids().latest_object(fid, oid).unwrap().unwrap();
        assert!(head.next().is_none());
    }

    #[test]
    fn test_delete_hides_record() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();

        let mut setup = engine.begin().unwrap();
        let oid = setup.insert(fid, Bytes::from_static(b"v")).unwrap();
        setup.commit().unwrap();

        let old = engine.begin().unwrap();
        let mut txn = engine.begin().unwrap();
        txn.delete(fid, oid).unwrap();
        assert_eq!(txn.read(fid, oid).unwrap(), None);
        txn.commit().unwrap();

        assert_eq!(engine.read_latest(fid, oid).unwrap(), None);
        assert_eq!(old.read(fid, oid).unwrap().as_deref(), Some(&b"v"[..]));

        let mut late = engine.begin().unwrap();
        assert!(matches!(
            late.update(fid, oid, Bytes::from_static(b"w")),
            Err(OidError::NotFound { .. })
        ));
    }

    #[test]
    fn test_gc_waits_for_old_snapshot() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let fid = engine.create_table("t").unwrap();

        let mut setup = engine.begin().unwrap();
        let oid = setup.insert(fid, Bytes::from_static(b"v0")).unwrap();
        setup.commit().unwrap();

        let reader = engine.begin().unwrap();
        for i in 1..=3u8 {
            let mut txn = engine.begin().unwrap();
            txn.update(fid, oid, Bytes::from(vec![b'v', b'0' + i])).unwrap();
            txn.commit().unwrap();
        }

        // The reader's version stays reachable while it runs.
        engine.collect_garbage().unwrap();
        assert_eq!(reader.read(fid, oid).unwrap().as_deref(), Some(&b"v0"[..]));
        drop(reader);

        engine.collect_garbage().unwrap();
        engine.collect_garbage().unwrap();
        let head = engine.oids().latest_object(fid, oid).unwrap().unwrap();
        assert!(head.next().is_none());
        assert_eq!(engine.stats().versions_reclaimed, 3);
        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"v3"[..]));
    }

    #[test]
    fn test_reopen_recovers_committed_data() {
        let dir = TempDir::new().unwrap();
        let (fid, oid, gone) = {
            let engine = open(&dir);
            let fid = engine.create_table("t").unwrap();
            let mut txn = engine.begin().unwrap();
            let oid = txn.insert(fid, Bytes::from_static(b"one")).unwrap();
            let gone = txn.insert(fid, Bytes::from_static(b"two")).unwrap();
            txn.commit().unwrap();

            let mut txn = engine.begin().unwrap();
            txn.update(fid, oid, Bytes::from_static(b"uno")).unwrap();
            txn.delete(fid, gone).unwrap();
            txn.commit().unwrap();
            engine.close().unwrap();
            (fid, oid, gone)
        };

        let engine = open(&dir);
        assert!(!engine.recovery_report().from_checkpoint);
        assert_eq!(engine.table("t"), Some(fid));
        assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"uno"[..]));
        assert_eq!(engine.read_latest(fid, gone).unwrap(), None);
        assert!(engine.stats().pins >= 1);
    }

    #[test]
    fn test_checkpoint_then_reopen() {
        let dir = TempDir::new().unwrap();
        let (fid, a, b) = {
            let engine = open(&dir);
            let fid = engine.create_table("t").unwrap();
            let mut txn = engine.begin().unwrap();
            let a = txn.insert(fid, Bytes::from_static(b"alpha")).unwrap();
            txn.commit().unwrap();

            let summary = engine.checkpoint().unwrap().unwrap();
            assert_eq!(summary.entries, 1);
            assert!(engine.checkpoint().unwrap().is_none());

            let mut txn = engine.begin().unwrap();
            let b = txn.insert(fid, Bytes::from_static(b"beta")).unwrap();
            txn.commit().unwrap();
            engine.close().unwrap();
            (fid, a, b)
        };

        let engine = open(&dir);
        assert!(engine.recovery_report().from_checkpoint);
        assert!(engine.storage().checkpoint().is_some());
        assert_eq!(engine.read_latest(fid, a).unwrap().as_deref(), Some(&b"alpha"[..]));
        assert_eq!(engine.read_latest(fid, b).unwrap().as_deref(), Some(&b"beta"[..]));

        // New inserts do not reuse recovered OIDs.
        let mut txn = engine.begin().unwrap();
        let c = txn.insert(fid, Bytes::from_static(b"gamma")).unwrap();
        assert!(c != a && c != b);
        txn.commit().unwrap();
    }

    #[test]
    fn test_closed_engine_rejects_work() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.close().unwrap();
        assert!(engine.begin().is_err());
        assert!(engine.create_table("t").is_err());
        engine.close().unwrap();
    }
}
