//! Rebuilding OID arrays from the log.
//!
//! Replay walks committed transactions in log order with a header scan.
//! Records are stamped with their transaction's commit LSN, which is the end
//! of the commit block; records read from spilled blocks are held until that
//! block is reached. Each data record becomes a `Storage` version pointing at
//! its frame in the log, so payloads are only read when first used.

use tracing::{debug, trace};

use sable_common::{Fid, Lsn, Oid, TaggedPtr};
use sable_log::{HeaderScan, RecordKind, RecoveryFunctor, ReplayError, ScanManager};

use crate::error::{OidError, OidResult};
use crate::manager::OidManager;
use crate::object::Object;

/// Counts from a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Transactions replayed.
    pub transactions: usize,
    /// Versions installed.
    pub versions: usize,
    /// Records skipped because the slot already held a newer version.
    pub skipped: usize,
    /// Files recreated from file records.
    pub files: usize,
}

/// The default recovery functor: replays the log into an [`OidManager`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OidReplay;

impl RecoveryFunctor<OidManager> for OidReplay {
    fn replay(&self, oids: &OidManager, scanner: &ScanManager<'_>, start: Lsn, end: Lsn) -> Result<(), ReplayError> {
        let stats = replay_range(oids, scanner, start, end)?;
        debug!(?start, ?end, ?stats, "replayed log range");
        Ok(())
    }
}

#[derive(Debug)]
enum Pending {
    Version { fid: Fid, oid: Oid, ptr: TaggedPtr, align: u8 },
    Delete { fid: Fid, oid: Oid },
    File { fid: Fid, name: String },
}

/// Replays every transaction whose commit block starts in `[start, end)`.
pub fn replay_range(oids: &OidManager, scanner: &ScanManager<'_>, start: Lsn, end: Lsn) -> OidResult<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut scan = scanner.new_header_scan(start);
    let mut pending = Vec::new();
    let mut commit_block = Lsn::INVALID;

    while scan.valid() {
        let spilled = scan.in_overflow_block();
        if !spilled {
            if scan.block_lsn().offset() >= end.offset() {
                break;
            }
            if scan.block_lsn() != commit_block {
                commit_block = scan.block_lsn();
                stats.transactions += 1;
            }
        }

        if let Some(record) = decode(&scan)? {
            pending.push(record);
        }

        if !spilled {
            let clsn = scan.block_next_lsn();
            for record in pending.drain(..) {
                apply(oids, record, clsn, &mut stats)?;
            }
        }
        scan.next();
    }

    if let Some(e) = scan.take_error() {
        return Err(e.into());
    }
    if !pending.is_empty() {
        trace!(records = pending.len(), "dropping spilled records without a commit block");
    }
    Ok(stats)
}

fn decode(scan: &HeaderScan<'_>) -> OidResult<Option<Pending>> {
    let (fid, oid) = (scan.fid(), scan.oid());
    let record = match scan.kind() {
        None => return Ok(None),
        Some(RecordKind::Fid) => {
            let name = scan.load_object()?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| OidError::invariant(format!("name of {fid:?} is not UTF-8")))?;
            Pending::File { fid, name }
        }
        Some(RecordKind::Delete | RecordKind::EnhancedDelete) => Pending::Delete { fid, oid },
        Some(
            RecordKind::Insert
            | RecordKind::InsertIndex
            | RecordKind::Update
            | RecordKind::UpdateKey
            | RecordKind::Relocate,
        ) => Pending::Version {
            fid,
            oid,
            ptr: scan.payload_ptr(true)?,
            align: scan.align_bits(),
        },
    };
    Ok(Some(record))
}

fn apply(oids: &OidManager, record: Pending, clsn: Lsn, stats: &mut ReplayStats) -> OidResult<()> {
    let (fid, oid, obj) = match record {
        Pending::File { fid, name } => {
            oids.recreate_file(fid, true)?;
            oids.set_file_name(fid, &name, clsn)?;
            stats.files += 1;
            return Ok(());
        }
        Pending::Delete { fid, oid } => (fid, oid, Object::tombstone(clsn)),
        Pending::Version { fid, oid, ptr, align } => (fid, oid, Object::from_storage(ptr, clsn, align)),
    };

    if !oids.file_exists(fid) {
        return Err(OidError::invariant(format!("log record for {oid:?} names unknown file {fid:?}")));
    }
    if oids.replay_version(fid, oid, obj)? {
        stats.versions += 1;
    } else {
        stats.skipped += 1;
    }
    Ok(())
}
