//! Per-file OID allocation.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use sable_common::constants::FIRST_OID;
use sable_common::{Fid, Oid};

use crate::error::{OidError, OidResult};

/// Hands out OIDs from a high-water mark and a free list.
#[derive(Debug)]
pub struct OidAllocator {
    fid: Fid,
    hwm: AtomicU32,
    free: Mutex<Vec<Oid>>,
    capacity: u32,
}

impl OidAllocator {
    /// Creates an allocator for a file whose array holds `capacity` slots.
    pub fn new(fid: Fid, capacity: usize) -> Self {
        Self::with_hwm(fid, capacity, Oid::new(FIRST_OID))
    }

    /// Creates an allocator whose next fresh OID is `hwm`.
    pub fn with_hwm(fid: Fid, capacity: usize, hwm: Oid) -> Self {
        Self {
            fid,
            hwm: AtomicU32::new(hwm.as_u32().max(FIRST_OID)),
            free: Mutex::new(Vec::new()),
            capacity: u32::try_from(capacity).unwrap_or(u32::MAX),
        }
    }

    /// Allocates an OID, reusing freed ones first.
    pub fn alloc(&self) -> OidResult<Oid> {
        if let Some(oid) = self.free.lock().pop() {
            return Ok(oid);
        }
        let mut cur = self.hwm.load(Ordering::Acquire);
        loop {
            if cur >= self.capacity {
                return Err(OidError::FileFull(self.fid));
            }
            match self
                .hwm
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(Oid::new(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns an OID for reuse.
    pub fn free(&self, oid: Oid) {
        self.free.lock().push(oid);
    }

    /// Next fresh OID.
    pub fn hwm(&self) -> Oid {
        Oid::new(self.hwm.load(Ordering::Acquire))
    }

    /// Number of OIDs waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}
