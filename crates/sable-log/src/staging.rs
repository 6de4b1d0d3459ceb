//! Per-transaction log staging.
//!
//! A [`TxLog`] collects a transaction's records and writes them as one commit
//! block. Transactions that outgrow a block spill completed blocks into the
//! log early; each spilled block is led by a `FatSkip` record naming the
//! previous spill, and the commit block is led by an `Overflow` record naming
//! the last one. Sequential scans only reach spilled blocks through the commit
//! block, so a transaction that never commits leaves nothing visible.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use sable_common::constants::{BLOCK_HEADER_SIZE, MAX_BLOCK_RECORDS, MAX_BLOCK_SIZE, MAX_INLINE_PAYLOAD};
use sable_common::{AddressSpace, Fid, Lsn, Oid, TaggedPtr};

use crate::alloc::Allocation;
use crate::block::{block_size, encode_block, payload_offsets, LogRecord, RecordSpec, RecordType};
use crate::error::{LogError, LogResult};
use crate::log::LogShared;
use crate::stats::LogStats;

/// Handle for a staged record; resolves to the payload location once written.
pub type RequestId = usize;

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    /// Commit LSN: the end of the commit block. Versions are stamped with it.
    pub commit_lsn: Lsn,
    /// Where the commit block starts, or invalid for an empty transaction.
    pub block_lsn: Lsn,
}

/// A transaction's staged log records.
pub struct TxLog {
    log: Arc<LogShared>,
    entries: Vec<RecordSpec>,
    batch_base: RequestId,
    payload_bytes: usize,
    locations: Vec<Option<TaggedPtr>>,
    prev_overflow: Lsn,
    commit_block: Option<Allocation>,
    commit_specs: Vec<RecordSpec>,
    clsn: Lsn,
}

impl TxLog {
    pub(crate) fn new(log: Arc<LogShared>) -> Self {
        Self {
            log,
            entries: Vec::new(),
            batch_base: 0,
            payload_bytes: 0,
            locations: Vec::new(),
            prev_overflow: Lsn::INVALID,
            commit_block: None,
            commit_specs: Vec::new(),
            clsn: Lsn::INVALID,
        }
    }

    /// Logs a new object.
    pub fn log_insert(&mut self, fid: Fid, oid: Oid, payload: Bytes, align_bits: u8) -> LogResult<RequestId> {
        self.add_object(RecordType::Insert, Some(RecordType::InsertExt), fid, oid, payload, align_bits)
    }

    /// Logs a new index entry.
    pub fn log_insert_index(
        &mut self,
        fid: Fid,
        oid: Oid,
        payload: Bytes,
        align_bits: u8,
    ) -> LogResult<RequestId> {
        self.add_object(RecordType::InsertIndex, None, fid, oid, payload, align_bits)
    }

    /// Logs a new version of an existing object.
    pub fn log_update(&mut self, fid: Fid, oid: Oid, payload: Bytes, align_bits: u8) -> LogResult<RequestId> {
        self.add_object(RecordType::Update, Some(RecordType::UpdateExt), fid, oid, payload, align_bits)
    }

    /// Logs an index key change.
    pub fn log_update_key(
        &mut self,
        fid: Fid,
        oid: Oid,
        payload: Bytes,
        align_bits: u8,
    ) -> LogResult<RequestId> {
        self.add_object(RecordType::UpdateKey, None, fid, oid, payload, align_bits)
    }

    /// Logs that an object now lives at `ptr`, which must already be durable.
    pub fn log_relocate(&mut self, fid: Fid, oid: Oid, ptr: TaggedPtr, align_bits: u8) -> LogResult<RequestId> {
        ptr.expect_space(AddressSpace::Log)?;
        let id = self.add_request(RecordSpec::external(
            RecordType::Relocate,
            fid,
            oid,
            ptr.as_u64(),
            ptr.size_code(),
            align_bits,
        ))?;
        self.locations[id] = Some(ptr);
        Ok(id)
    }

    /// Logs a deletion.
    pub fn log_delete(&mut self, fid: Fid, oid: Oid) -> LogResult<RequestId> {
        self.add_request(RecordSpec::bare(RecordType::Delete, fid, oid))
    }

    /// Logs a deletion carrying the deleted image.
    pub fn log_enhanced_delete(
        &mut self,
        fid: Fid,
        oid: Oid,
        payload: Bytes,
        align_bits: u8,
    ) -> LogResult<RequestId> {
        self.add_object(RecordType::EnhancedDelete, None, fid, oid, payload, align_bits)
    }

    /// Logs the creation of file `fid` named `name`.
    pub fn log_table(&mut self, fid: Fid, name: &str) -> LogResult<RequestId> {
        self.add_request(RecordSpec::with_payload(
            RecordType::Fid,
            fid,
            Oid::new(fid.as_u32()),
            Bytes::copy_from_slice(name.as_bytes()),
            0,
        ))
    }

    fn add_object(
        &mut self,
        rtype: RecordType,
        ext_type: Option<RecordType>,
        fid: Fid,
        oid: Oid,
        payload: Bytes,
        align_bits: u8,
    ) -> LogResult<RequestId> {
        match ext_type {
            Some(ext_type) if payload.len() > MAX_INLINE_PAYLOAD => {
                self.check_open()?;
                let target = self.write_external(payload, align_bits)?;
                let id = self.add_request(RecordSpec::external(
                    ext_type,
                    fid,
                    oid,
                    target.as_u64(),
                    target.size_code(),
                    align_bits,
                ))?;
                self.locations[id] = Some(target);
                Ok(id)
            }
            _ => self.add_request(RecordSpec::with_payload(rtype, fid, oid, payload, align_bits)),
        }
    }

    /// Stages a record, spilling the current batch first if it would not fit.
    pub fn add_request(&mut self, spec: RecordSpec) -> LogResult<RequestId> {
        self.check_open()?;
        let padded = spec.padded_len()?;

        // One record slot is kept for the chain record.
        let nrec = self.entries.len() + 2;
        let size = BLOCK_HEADER_SIZE + nrec * LogRecord::SIZE + self.payload_bytes + padded;
        if !self.entries.is_empty() && (nrec > MAX_BLOCK_RECORDS || size > MAX_BLOCK_SIZE) {
            self.spill()?;
        }

        let id = self.locations.len();
        self.locations.push(None);
        self.entries.push(spec);
        self.payload_bytes += padded;
        Ok(id)
    }

    /// Writes an oversized payload into its own block and returns a pointer to it.
    fn write_external(&mut self, payload: Bytes, align_bits: u8) -> LogResult<TaggedPtr> {
        let holder = RecordSpec::with_payload(
            RecordType::Comment,
            Fid::INVALID,
            Oid::INVALID,
            payload,
            align_bits,
        );
        let size_code = holder.size_code;
        let specs = [RecordSpec::chain(RecordType::FatSkip, Lsn::INVALID), holder];

        let alloc = self.log.alloc.allocate(block_size(&specs)?)?;
        let offsets = payload_offsets(&specs)?;
        self.write_block(&alloc, &specs)?;
        Ok(TaggedPtr::log(alloc.lsn.advance(offsets[1] as u64), size_code))
    }

    /// Writes the current batch as a chained overflow block.
    fn spill(&mut self) -> LogResult<()> {
        let mut specs = Vec::with_capacity(self.entries.len() + 1);
        specs.push(RecordSpec::chain(RecordType::FatSkip, self.prev_overflow));
        specs.append(&mut self.entries);

        let alloc = self.log.alloc.allocate(block_size(&specs)?)?;
        self.assign_locations(&alloc, &specs, 1)?;
        self.write_block(&alloc, &specs)?;

        self.prev_overflow = alloc.lsn;
        self.batch_base = self.locations.len();
        self.payload_bytes = 0;
        LogStats::bump(&self.log.stats.overflow_blocks);
        Ok(())
    }

    fn write_block(&self, alloc: &Allocation, specs: &[RecordSpec]) -> LogResult<()> {
        match encode_block(alloc.lsn, alloc.next_lsn, specs) {
            Ok(bytes) => self.log.alloc.publish(alloc, &bytes),
            Err(e) => {
                self.log.alloc.fill_skip(alloc)?;
                Err(e)
            }
        }
    }

    /// Records where the current batch's payloads land. The first `lead`
    /// specs are chain records.
    fn assign_locations(&mut self, alloc: &Allocation, specs: &[RecordSpec], lead: usize) -> LogResult<()> {
        let offsets = payload_offsets(specs)?;
        for (i, spec) in specs.iter().enumerate().skip(lead) {
            let slot = &mut self.locations[self.batch_base + i - lead];
            if slot.is_none() && spec.rtype.has_payload() {
                *slot = Some(TaggedPtr::log(
                    alloc.lsn.advance(offsets[i] as u64),
                    spec.size_code,
                ));
            }
        }
        Ok(())
    }

    /// Reserves the commit block and fixes the commit LSN.
    ///
    /// Idempotent. After this, payload locations of every request are known and
    /// no further requests may be added.
    pub fn pre_commit(&mut self) -> LogResult<Lsn> {
        if self.clsn.is_valid() {
            return Ok(self.clsn);
        }

        let mut specs = Vec::with_capacity(self.entries.len() + 1);
        if self.prev_overflow.is_valid() {
            specs.push(RecordSpec::chain(RecordType::Overflow, self.prev_overflow));
        }
        specs.append(&mut self.entries);

        if specs.is_empty() {
            self.clsn = self.log.cur_lsn()?;
            return Ok(self.clsn);
        }

        let lead = usize::from(self.prev_overflow.is_valid());
        let alloc = self.log.alloc.allocate(block_size(&specs)?)?;
        self.commit_block = Some(alloc);
        self.assign_locations(&alloc, &specs, lead)?;
        self.commit_specs = specs;
        self.clsn = alloc.next_lsn;
        Ok(self.clsn)
    }

    /// Writes the commit block.
    pub fn commit(mut self) -> LogResult<CommitRecord> {
        let commit_lsn = self.pre_commit()?;
        let block_lsn = match self.commit_block.take() {
            Some(alloc) => {
                self.write_block(&alloc, &self.commit_specs)?;
                alloc.lsn
            }
            None => Lsn::INVALID,
        };
        LogStats::bump(&self.log.stats.commits);
        Ok(CommitRecord {
            commit_lsn,
            block_lsn,
        })
    }

    /// Abandons the transaction.
    ///
    /// If a commit block was reserved, it is filled with a skip block.
    pub fn discard(mut self) -> LogResult<()> {
        if let Some(alloc) = self.commit_block.take() {
            self.log.alloc.fill_skip(&alloc)?;
            LogStats::bump(&self.log.stats.discards);
        }
        Ok(())
    }

    /// Commit LSN, or invalid before pre-commit.
    pub fn clsn(&self) -> Lsn {
        self.clsn
    }

    /// Start of the reserved commit block, if any.
    pub fn commit_block_lsn(&self) -> Option<Lsn> {
        self.commit_block.map(|a| a.lsn)
    }

    /// Where request `id`'s payload lives in the log, once known.
    ///
    /// Known after the request's block spilled or after pre-commit. For an
    /// externalized payload this is the payload itself, not the stored pointer.
    pub fn payload_ptr(&self, id: RequestId) -> Option<TaggedPtr> {
        self.locations.get(id).copied().flatten()
    }

    /// Number of staged requests, including spilled ones.
    pub fn request_count(&self) -> usize {
        self.locations.len()
    }

    /// Returns true if part of the transaction was spilled ahead of the commit block.
    pub fn has_overflow(&self) -> bool {
        self.prev_overflow.is_valid()
    }

    fn check_open(&self) -> LogResult<()> {
        if self.clsn.is_valid() {
            return Err(LogError::invariant("request added after pre-commit"));
        }
        Ok(())
    }
}

impl Drop for TxLog {
    fn drop(&mut self) {
        if let Some(alloc) = self.commit_block.take() {
            if let Err(e) = self.log.alloc.fill_skip(&alloc) {
                warn!(error = %e, lsn = ?alloc.lsn, "could not release abandoned commit block");
            }
        }
    }
}

impl std::fmt::Debug for TxLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxLog")
            .field("requests", &self.request_count())
            .field("pending", &self.entries.len())
            .field("prev_overflow", &self.prev_overflow)
            .field("clsn", &self.clsn)
            .finish()
    }
}
