//! Snapshot-isolation transactions.
//!
//! A transaction reads as of the log position at which it began and writes
//! by pushing in-flight versions onto chains, first-updater-wins. Commit
//! stages the writes in the transaction's [`TxLog`], reserves the commit
//! block, points every version at its logged frame and then publishes the
//! commit LSN on all of them.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use sable_common::{Fid, Lsn, Oid, TaggedPtr, Xid};
use sable_log::{RequestId, TxLog};

use crate::engine::EngineShared;
use crate::error::{OidError, OidResult};
use crate::gc::EpochGuard;
use crate::object::{Object, ObjectFrame};
use crate::snapshot::Snapshot;
use crate::stats::EngineStats;

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Reads and writes are allowed.
    Active,
    /// Commit is in progress.
    Committing,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

impl TransactionState {
    /// Returns true if the transaction can perform operations.
    pub fn is_active(&self) -> bool {
        *self == TransactionState::Active
    }

    /// Returns true if the transaction has ended.
    pub fn is_ended(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "Active"),
            TransactionState::Committing => write!(f, "Committing"),
            TransactionState::Committed => write!(f, "Committed"),
            TransactionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A version written by the transaction.
#[derive(Debug, Clone)]
struct WriteRecord {
    fid: Fid,
    oid: Oid,
    obj: Arc<Object>,
    request: Option<RequestId>,
    is_insert: bool,
}

/// A transaction handle.
///
/// Dropping an active transaction aborts it.
pub struct Transaction {
    shared: Arc<EngineShared>,
    xid: Xid,
    snapshot: Snapshot,
    state: TransactionState,
    txlog: Option<TxLog>,
    writes: Vec<WriteRecord>,
    _guard: EpochGuard,
}

impl Transaction {
    pub(crate) fn begin(shared: Arc<EngineShared>, xid: Xid) -> OidResult<Self> {
        // Pin before taking the snapshot so no version it can see is released.
        let guard = shared.epochs.pin();
        let begin = {
            let _gate = shared.begin_gate.read();
            let begin = shared.log.cur_lsn()?;
            shared.active.insert(xid, begin);
            begin
        };
        EngineStats::bump(&shared.stats.begins);
        let txlog = shared.log.new_tx_log();
        trace!(?xid, ?begin, "transaction started");
        Ok(Self {
            shared,
            xid,
            snapshot: Snapshot::for_txn(xid, begin),
            state: TransactionState::Active,
            txlog: Some(txlog),
            writes: Vec::new(),
            _guard: guard,
        })
    }

    /// Transaction id.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// The transaction's snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of versions written so far.
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    fn check_active(&self) -> OidResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(OidError::TransactionClosed)
        }
    }

    fn txlog(&mut self) -> OidResult<&mut TxLog> {
        self.txlog.as_mut().ok_or(OidError::TransactionClosed)
    }

    /// Reads the record as the snapshot sees it. Deleted or absent records read as `None`.
    pub fn read(&self, fid: Fid, oid: Oid) -> OidResult<Option<Bytes>> {
        self.check_active()?;
        match self.shared.oids.get_version(fid, oid, &self.snapshot)? {
            Some(obj) => obj.data(&self.shared.storage),
            None => Ok(None),
        }
    }

    /// Inserts a new record and returns its OID.
    ///
    /// Records must not be empty; a zero-length stored record is a delete.
    pub fn insert(&mut self, fid: Fid, payload: Bytes) -> OidResult<Oid> {
        self.check_active()?;
        if payload.is_empty() {
            return Err(OidError::EmptyPayload { fid });
        }
        let align = self.shared.config.align_bits;
        let oid = self.shared.oids.alloc_oid(fid)?;
        let frame = ObjectFrame::encode(Some(&payload), TaggedPtr::NULL);
        let obj = Arc::new(Object::in_flight(self.xid, Some(payload), align));
        if let Err(e) = self.shared.oids.install_new(fid, oid, Arc::clone(&obj)) {
            self.shared.oids.free_oid(fid, oid)?;
            return Err(e);
        }

        let logged = self.txlog()?.log_insert(fid, oid, frame, align);
        self.writes.push(WriteRecord {
            fid,
            oid,
            obj,
            request: logged.as_ref().ok().copied(),
            is_insert: true,
        });
        logged?;
        Ok(oid)
    }

    /// Replaces a record's payload.
    pub fn update(&mut self, fid: Fid, oid: Oid, payload: Bytes) -> OidResult<()> {
        self.check_active()?;
        if payload.is_empty() {
            return Err(OidError::EmptyPayload { fid });
        }
        let align = self.shared.config.align_bits;
        let obj = Arc::new(Object::in_flight(self.xid, Some(payload.clone()), align));
        let is_insert = self.install(fid, oid, &obj)?;

        let prev = obj.next().map_or(TaggedPtr::NULL, |n| n.pdest());
        let frame = ObjectFrame::encode(Some(&payload), prev);
        let logged = self.txlog()?.log_update(fid, oid, frame, align);
        self.record(fid, oid, obj, logged.as_ref().ok().copied(), is_insert);
        logged?;
        Ok(())
    }

    /// Deletes a record.
    pub fn delete(&mut self, fid: Fid, oid: Oid) -> OidResult<()> {
        self.check_active()?;
        let obj = Arc::new(Object::in_flight(self.xid, None, self.shared.config.align_bits));
        let is_insert = self.install(fid, oid, &obj)?;

        let logged = self.txlog()?.log_delete(fid, oid);
        self.record(fid, oid, obj, logged.as_ref().ok().copied(), is_insert);
        logged?;
        Ok(())
    }

    /// Installs `obj`; returns whether it replaced this transaction's own insert.
    fn install(&mut self, fid: Fid, oid: Oid, obj: &Arc<Object>) -> OidResult<bool> {
        let replaced = match self
            .shared
            .oids
            .install_version(fid, oid, Arc::clone(obj), &self.snapshot)
        {
            Ok(replaced) => replaced,
            Err(e) => {
                if e.is_conflict() {
                    EngineStats::bump(&self.shared.stats.conflicts);
                }
                return Err(e);
            }
        };

        let Some(replaced) = replaced else {
            return Ok(false);
        };
        match self.writes.iter().position(|w| Arc::ptr_eq(&w.obj, &replaced)) {
            Some(pos) => Ok(self.writes.remove(pos).is_insert),
            None => Err(OidError::invariant(format!("{oid:?} in {fid:?}: replaced a version this transaction never wrote"))),
        }
    }

    fn record(&mut self, fid: Fid, oid: Oid, obj: Arc<Object>, request: Option<RequestId>, is_insert: bool) {
        self.writes.push(WriteRecord {
            fid,
            oid,
            obj,
            request,
            is_insert,
        });
    }

    /// Commits and returns the commit LSN.
    ///
    /// With `sync_commit` set, returns once the commit is durable. A failure
    /// before the commit block is published rolls the transaction back. Once
    /// published the versions stay committed; a failed durability wait is
    /// reported as [`OidError::NotDurable`].
    pub fn commit(mut self) -> OidResult<Lsn> {
        self.check_active()?;
        self.state = TransactionState::Committing;
        let clsn = match self.publish() {
            Ok(clsn) => clsn,
            Err(e) => {
                warn!(xid = ?self.xid, error = %e, "commit failed, rolling back");
                if let Err(undo) = self.rollback() {
                    warn!(xid = ?self.xid, error = %undo, "rollback after failed commit also failed");
                }
                return Err(e);
            }
        };

        self.state = TransactionState::Committed;
        self.shared.active.remove(&self.xid);
        EngineStats::bump(&self.shared.stats.commits);
        trace!(xid = ?self.xid, ?clsn, writes = self.writes.len(), "transaction committed");

        if self.shared.config.sync_commit && !self.writes.is_empty() {
            if let Err(source) = self.shared.log.wait_for_durable(clsn) {
                warn!(xid = ?self.xid, ?clsn, error = %source, "committed transaction is not durable");
                return Err(OidError::NotDurable { clsn, source });
            }
        }
        Ok(clsn)
    }

    /// Writes the commit block and stamps every version with the commit LSN.
    fn publish(&mut self) -> OidResult<Lsn> {
        if self.writes.iter().any(|w| w.request.is_none()) {
            return Err(OidError::invariant("a write was never logged"));
        }
        let mut txlog = self.txlog.take().ok_or(OidError::TransactionClosed)?;

        for write in &self.writes {
            write.obj.mark_committing();
        }
        if let Err(e) = txlog.pre_commit() {
            self.txlog = Some(txlog);
            return Err(e.into());
        }
        for write in &self.writes {
            if let Some(ptr) = write.request.and_then(|r| txlog.payload_ptr(r)) {
                write.obj.set_pdest(ptr);
            }
        }

        let rec = txlog.commit()?;
        for write in &self.writes {
            write.obj.stamp_commit(rec.commit_lsn);
        }
        Ok(rec.commit_lsn)
    }

    /// Rolls back every write.
    pub fn abort(mut self) -> OidResult<()> {
        self.check_active()?;
        self.rollback()
    }

    fn rollback(&mut self) -> OidResult<()> {
        let mut first_err = None;
        for write in self.writes.drain(..).rev() {
            write.obj.revert_in_flight();
            let undone = self
                .shared
                .oids
                .unlink_version(write.fid, write.oid, &write.obj)
                .and_then(|()| {
                    if write.is_insert {
                        self.shared.oids.free_oid(write.fid, write.oid).map(|_| ())
                    } else {
                        Ok(())
                    }
                });
            if let Err(e) = undone {
                first_err.get_or_insert(e);
            }
        }
        if let Some(txlog) = self.txlog.take() {
            if let Err(e) = txlog.discard() {
                first_err.get_or_insert(e.into());
            }
        }

        self.state = TransactionState::Aborted;
        self.shared.active.remove(&self.xid);
        EngineStats::bump(&self.shared.stats.aborts);
        trace!(xid = ?self.xid, "transaction aborted");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_ended() {
            return;
        }
        if let Err(e) = self.rollback() {
            warn!(xid = ?self.xid, error = %e, "rollback of dropped transaction failed");
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("snapshot", &self.snapshot)
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .finish()
    }
}
