//! Snapshot visibility.
//!
//! A snapshot is taken at an LSN. A version V is visible to it if:
//! 1. V committed at or before the snapshot LSN, or
//! 2. V was written by the snapshot's own transaction and is still in flight.
//!
//! A version caught mid-commit is waited on until its stamp is published, so
//! the answer never depends on timing.

use std::sync::Arc;

use sable_common::{Lsn, Xid};

use crate::object::{Object, Stamp};

/// A consistent read point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    begin: Lsn,
    xid: Xid,
}

impl Snapshot {
    /// A read-only snapshot at `begin`.
    pub fn at(begin: Lsn) -> Self {
        Self {
            begin,
            xid: Xid::INVALID,
        }
    }

    /// The snapshot of transaction `xid`, which also sees its own writes.
    pub fn for_txn(xid: Xid, begin: Lsn) -> Self {
        Self { begin, xid }
    }

    /// Snapshot LSN.
    pub fn begin(&self) -> Lsn {
        self.begin
    }

    /// Owning transaction, or invalid for a read-only snapshot.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Returns true if a version committed at `clsn` is visible.
    pub fn sees_commit(&self, clsn: Lsn) -> bool {
        clsn.offset() <= self.begin.offset()
    }

    /// Returns true if the snapshot's transaction wrote `obj`.
    pub fn owns(&self, obj: &Object) -> bool {
        self.xid != Xid::INVALID && obj.owner() == self.xid
    }

    /// Returns true if `obj` is visible.
    pub fn is_visible(&self, obj: &Object) -> bool {
        match obj.wait_stamp() {
            Stamp::Committed(clsn) => self.sees_commit(clsn),
            Stamp::InFlight => self.owns(obj),
            Stamp::Committing => false,
        }
    }

    /// Walks a chain from `head` to the first visible version.
    pub fn visible_version(&self, head: Arc<Object>) -> Option<Arc<Object>> {
        let mut cur = Some(head);
        while let Some(obj) = cur {
            if self.is_visible(&obj) {
                return Some(obj);
            }
            cur = obj.next();
        }
        None
    }
}
