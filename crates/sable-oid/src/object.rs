//! Versions and their lazy materialization.
//!
//! An [`Object`] is one version of a record. Versions recovered from the log
//! or a checkpoint start in `Storage` state with only a tagged pointer to
//! their frame; the first reader to [`pin`](Object::pin) one loads it. Status
//! moves forward only:
//!
//! ```text
//! Storage --(CAS)--> Loading --> Memory
//!                            \-> Deleted
//! ```
//!
//! A failed load puts the version back in `Storage` so a later pin can retry.
//!
//! Each version also carries a commit stamp. It is zero while the owning
//! transaction is in flight, [`COMMITTING`] between pre-commit and the final
//! stamp, and the commit LSN afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use sable_common::constants::{OBJECT_FRAME_HEADER_SIZE, SPIN_LIMIT};
use sable_common::{Lsn, TaggedPtr, Xid};
use sable_log::Log;

use crate::error::{OidError, OidResult};

/// Stamp of a version whose transaction is between pre-commit and commit.
pub const COMMITTING: u64 = u64::MAX;

const IN_FLIGHT: u64 = 0;

/// Materialization state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectStatus {
    /// Only the storage pointer is known.
    Storage = 0,
    /// A reader is loading the frame.
    Loading = 1,
    /// The payload is in memory.
    Memory = 2,
    /// The version is a tombstone.
    Deleted = 3,
}

impl ObjectStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Storage,
            1 => Self::Loading,
            2 => Self::Memory,
            _ => Self::Deleted,
        }
    }
}

/// Commit state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// The writer has not started committing.
    InFlight,
    /// The writer is committing; the commit LSN is about to be published.
    Committing,
    /// Committed at the given LSN.
    Committed(Lsn),
}

impl Stamp {
    fn from_raw(raw: u64) -> Self {
        match raw {
            IN_FLIGHT => Self::InFlight,
            COMMITTING => Self::Committing,
            lsn => Self::Committed(Lsn::from_u64(lsn)),
        }
    }
}

/// Where stored frames are read from.
pub trait PayloadSource: Send + Sync {
    /// Reads the stored bytes `ptr` refers to.
    fn load(&self, ptr: TaggedPtr, align_bits: u8) -> OidResult<Bytes>;
}

impl PayloadSource for Log {
    fn load(&self, ptr: TaggedPtr, align_bits: u8) -> OidResult<Bytes> {
        Ok(self.load_object(ptr, align_bits)?)
    }
}

/// One version of a record.
pub struct Object {
    status: AtomicU8,
    align_bits: u8,
    owner: Xid,
    stamp: AtomicU64,
    pdest: AtomicU64,
    next: ArcSwapOption<Object>,
    payload: OnceLock<Bytes>,
}

impl Object {
    fn new(status: ObjectStatus, owner: Xid, stamp: u64, pdest: TaggedPtr, align_bits: u8) -> Self {
        Self {
            status: AtomicU8::new(status as u8),
            align_bits,
            owner,
            stamp: AtomicU64::new(stamp),
            pdest: AtomicU64::new(pdest.as_u64()),
            next: ArcSwapOption::from(None),
            payload: OnceLock::new(),
        }
    }

    /// A version written by an in-flight transaction. `None` is a delete.
    pub fn in_flight(owner: Xid, payload: Option<Bytes>, align_bits: u8) -> Self {
        match payload {
            Some(bytes) => {
                let obj = Self::new(ObjectStatus::Memory, owner, IN_FLIGHT, TaggedPtr::NULL, align_bits);
                let _ = obj.payload.set(bytes);
                obj
            }
            None => Self::new(ObjectStatus::Deleted, owner, IN_FLIGHT, TaggedPtr::NULL, align_bits),
        }
    }

    /// A committed version whose frame is still in storage.
    pub fn from_storage(pdest: TaggedPtr, clsn: Lsn, align_bits: u8) -> Self {
        Self::new(ObjectStatus::Storage, Xid::INVALID, clsn.as_u64(), pdest, align_bits)
    }

    /// A committed, already materialized version.
    pub fn committed(payload: Bytes, clsn: Lsn, align_bits: u8) -> Self {
        let obj = Self::new(ObjectStatus::Memory, Xid::INVALID, clsn.as_u64(), TaggedPtr::NULL, align_bits);
        let _ = obj.payload.set(payload);
        obj
    }

    /// A committed tombstone.
    pub fn tombstone(clsn: Lsn) -> Self {
        Self::new(ObjectStatus::Deleted, Xid::INVALID, clsn.as_u64(), TaggedPtr::NULL, 0)
    }

    /// Current status.
    pub fn status(&self) -> ObjectStatus {
        ObjectStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns true once the version is known to be a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.status() == ObjectStatus::Deleted
    }

    /// Transaction that wrote the version, or invalid for recovered versions.
    pub fn owner(&self) -> Xid {
        self.owner
    }

    /// Alignment the version was stored with.
    pub fn align_bits(&self) -> u8 {
        self.align_bits
    }

    /// Current commit state.
    pub fn stamp(&self) -> Stamp {
        Stamp::from_raw(self.stamp.load(Ordering::Acquire))
    }

    /// Commit state, waiting out a commit in progress.
    pub fn wait_stamp(&self) -> Stamp {
        let mut spins = 0;
        loop {
            match self.stamp() {
                Stamp::Committing => backoff(&mut spins),
                stamp => return stamp,
            }
        }
    }

    /// Commit LSN, once committed.
    pub fn clsn(&self) -> Option<Lsn> {
        match self.stamp() {
            Stamp::Committed(lsn) => Some(lsn),
            _ => None,
        }
    }

    /// Marks the version as committing.
    pub fn mark_committing(&self) {
        self.stamp.store(COMMITTING, Ordering::Release);
    }

    /// Publishes the commit LSN.
    pub fn stamp_commit(&self, clsn: Lsn) {
        self.stamp.store(clsn.as_u64(), Ordering::Release);
    }

    /// Returns the version to the in-flight state after a failed commit.
    pub fn revert_in_flight(&self) {
        self.stamp.store(IN_FLIGHT, Ordering::Release);
    }

    /// Where the version's frame is stored, or null if it never was.
    pub fn pdest(&self) -> TaggedPtr {
        TaggedPtr::from_u64(self.pdest.load(Ordering::Acquire))
    }

    /// Records where the version's frame is stored.
    pub fn set_pdest(&self, ptr: TaggedPtr) {
        self.pdest.store(ptr.as_u64(), Ordering::Release);
    }

    /// The next older version.
    pub fn next(&self) -> Option<Arc<Object>> {
        self.next.load_full()
    }

    /// Links the next older version.
    pub fn set_next(&self, next: Option<Arc<Object>>) {
        self.next.store(next);
    }

    /// Unlinks and returns everything older than this version.
    pub fn take_next(&self) -> Option<Arc<Object>> {
        self.next.swap(None)
    }

    /// The payload, if materialized.
    pub fn payload(&self) -> Option<Bytes> {
        match self.status() {
            ObjectStatus::Memory => self.payload.get().cloned(),
            _ => None,
        }
    }

    /// Materializes the version.
    ///
    /// Exactly one caller loads a `Storage` version; concurrent callers wait
    /// for it. Returns immediately for materialized versions and tombstones.
    pub fn pin(&self, source: &dyn PayloadSource) -> OidResult<()> {
        let mut spins = 0;
        loop {
            match self.status() {
                ObjectStatus::Memory | ObjectStatus::Deleted => return Ok(()),
                ObjectStatus::Loading => backoff(&mut spins),
                ObjectStatus::Storage => {
                    if self
                        .status
                        .compare_exchange(
                            ObjectStatus::Storage as u8,
                            ObjectStatus::Loading as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    return match self.materialize(source) {
                        Ok(Some(data)) => {
                            let _ = self.payload.set(data);
                            self.status.store(ObjectStatus::Memory as u8, Ordering::Release);
                            Ok(())
                        }
                        Ok(None) => {
                            self.status.store(ObjectStatus::Deleted as u8, Ordering::Release);
                            Ok(())
                        }
                        Err(e) => {
                            self.status.store(ObjectStatus::Storage as u8, Ordering::Release);
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Pins the version and returns its payload, or `None` for a tombstone.
    pub fn data(&self, source: &dyn PayloadSource) -> OidResult<Option<Bytes>> {
        self.pin(source)?;
        Ok(self.payload())
    }

    fn materialize(&self, source: &dyn PayloadSource) -> OidResult<Option<Bytes>> {
        let ptr = self.pdest();
        if ptr.is_null() {
            return Err(OidError::invariant("stored version without a storage pointer"));
        }
        let raw = source.load(ptr, self.align_bits)?;
        Ok(ObjectFrame::decode(&raw)?.data)
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        // Unlink iteratively so a long chain cannot exhaust the stack.
        let mut next = self.next.swap(None);
        while let Some(obj) = next {
            next = match Arc::try_unwrap(obj) {
                Ok(obj) => obj.next.swap(None),
                Err(_) => None,
            };
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("status", &self.status())
            .field("owner", &self.owner)
            .field("stamp", &self.stamp())
            .field("pdest", &self.pdest())
            .finish()
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// A decoded object frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Record bytes, or `None` for a delete.
    pub data: Option<Bytes>,
    /// Storage pointer of the version this one replaced.
    pub prev: TaggedPtr,
}

/// The stored form of a version.
///
/// Layout (16-byte header, big-endian):
/// - len: 4 bytes (zero marks a delete)
/// - reserved: 4 bytes
/// - prev: 8 bytes
///
/// The record bytes follow. Trailing padding is ignored.
pub struct ObjectFrame;

impl ObjectFrame {
    /// Encodes a frame. `None` encodes a delete; live records are never empty.
    pub fn encode(data: Option<&[u8]>, prev: TaggedPtr) -> Bytes {
        let body = data.unwrap_or_default();
        let mut buf = BytesMut::with_capacity(OBJECT_FRAME_HEADER_SIZE + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_u32(0);
        buf.put_u64(prev.as_u64());
        buf.put_slice(body);
        buf.freeze()
    }

    /// Decodes a frame.
    pub fn decode(raw: &Bytes) -> OidResult<DecodedFrame> {
        if raw.len() < OBJECT_FRAME_HEADER_SIZE {
            return Err(OidError::bad_frame(format!("{} bytes is shorter than a frame header", raw.len())));
        }
        let mut head = &raw[..OBJECT_FRAME_HEADER_SIZE];
        let len = head.get_u32() as usize;
        let _reserved = head.get_u32();
        let prev = TaggedPtr::from_u64(head.get_u64());

        if len == 0 {
            return Ok(DecodedFrame { data: None, prev });
        }
        let end = OBJECT_FRAME_HEADER_SIZE + len;
        if end > raw.len() {
            return Err(OidError::bad_frame(format!(
                "frame declares {len} bytes, {} available",
                raw.len() - OBJECT_FRAME_HEADER_SIZE
            )));
        }
        Ok(DecodedFrame {
            data: Some(raw.slice(OBJECT_FRAME_HEADER_SIZE..end)),
            prev,
        })
    }
}
