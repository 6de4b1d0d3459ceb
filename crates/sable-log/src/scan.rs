//! Log scanners.
//!
//! Scanning happens in layers:
//!
//! - [`BlockScanner`] walks blocks, validating each one and optionally
//!   chasing overflow chains so a spilled transaction surfaces in write order.
//! - [`LogScanner`] walks records inside those blocks, hiding control records.
//! - [`Scan`] adds payload helpers on top of a `LogScanner`. It comes in two
//!   variants: [`HeaderScan`] reads only block headers and record entries and
//!   loads payloads on demand, while [`RecordScan`] reads whole blocks and can
//!   be limited to a single transaction.
//!
//! A block that fails validation ends the scan; a crash always leaves a ragged
//! tail, so corruption is indistinguishable from the end of the log.

use std::marker::PhantomData;

use bytes::Bytes;
use tracing::{debug, trace};

use sable_common::constants::{BLOCK_HEADER_SIZE, MAX_BLOCK_RECORDS, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use sable_common::{Fid, Lsn, Oid, SizeCode, TaggedPtr};

use crate::block::{records_end, BlockHeader, LogBlock, LogRecord, RecordKind, RecordType};
use crate::error::{LogError, LogResult};
use crate::log::LogShared;
use crate::segment::SegmentTable;

/// Byte-level access to the log for scanners.
pub trait LogSource: Send + Sync {
    /// Reads up to `buf.len()` bytes at `lsn`.
    ///
    /// Returns fewer bytes at the end of the readable log and zero for an LSN
    /// no segment covers.
    fn read_log(&self, lsn: Lsn, buf: &mut [u8]) -> LogResult<usize>;

    /// Whether full-block reads verify checksums.
    fn verify_checksums(&self) -> bool {
        true
    }
}

impl LogSource for SegmentTable {
    fn read_log(&self, lsn: Lsn, buf: &mut [u8]) -> LogResult<usize> {
        self.read(lsn, buf)
    }
}

/// Walks validated blocks.
pub struct BlockScanner<'a> {
    source: &'a dyn LogSource,
    follow_overflow: bool,
    fetch_payloads: bool,
    chain: Vec<Lsn>,
    current: Option<LogBlock>,
    error: Option<LogError>,
}

impl<'a> BlockScanner<'a> {
    /// Positions a scanner on the block at `start`.
    ///
    /// With `follow_overflow`, a block led by `Overflow` is preceded by the
    /// spilled blocks it names, and `FatSkip`-led blocks met in sequence are
    /// passed over. Without `fetch_payloads` only headers and record entries
    /// are read.
    pub fn new(source: &'a dyn LogSource, start: Lsn, follow_overflow: bool, fetch_payloads: bool) -> Self {
        let mut scanner = Self {
            source,
            follow_overflow,
            fetch_payloads,
            chain: Vec::new(),
            current: None,
            error: None,
        };
        scanner.load(start, follow_overflow);
        scanner
    }

    /// Returns true while positioned on a valid block.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The current block.
    pub fn block(&self) -> Option<&LogBlock> {
        self.current.as_ref()
    }

    /// Moves to the next block.
    pub fn next(&mut self) {
        if let Some(pending) = self.chain.pop() {
            // Chained blocks are returned as they are, oldest first.
            self.load(pending, false);
            return;
        }
        if let Some(next) = self.current.as_ref().map(LogBlock::next_lsn) {
            self.load(next, self.follow_overflow);
        }
    }

    /// Returns and clears an I/O error that ended the scan, if any.
    pub fn take_error(&mut self) -> Option<LogError> {
        self.error.take()
    }

    fn load(&mut self, mut lsn: Lsn, follow: bool) {
        self.current = None;
        let mut chasing = false;
        loop {
            let Some(block) = self.read_block(lsn) else {
                return;
            };
            if follow {
                match block.first_type() {
                    RecordType::Overflow => {
                        self.chain.push(lsn);
                        lsn = block.chain_lsn();
                        chasing = true;
                        continue;
                    }
                    RecordType::FatSkip if chasing => {
                        let prev = block.chain_lsn();
                        if prev.is_valid() {
                            self.chain.push(lsn);
                            lsn = prev;
                            continue;
                        }
                    }
                    RecordType::FatSkip => {
                        lsn = block.next_lsn();
                        continue;
                    }
                    _ => {}
                }
            }
            self.current = Some(block);
            return;
        }
    }

    fn read_block(&mut self, lsn: Lsn) -> Option<LogBlock> {
        if !lsn.is_valid() {
            return None;
        }

        let mut head = [0u8; BLOCK_HEADER_SIZE];
        if self.read(lsn, &mut head)? < BLOCK_HEADER_SIZE {
            return None;
        }
        let header = BlockHeader::decode(&head)?;
        let nrec = header.nrec as usize;
        let size = header.block_size()?;
        if nrec == 0 || nrec > MAX_BLOCK_RECORDS || size > MAX_BLOCK_SIZE + MIN_BLOCK_SIZE {
            trace!(?lsn, nrec, size, "implausible block header");
            return None;
        }

        let want = if self.fetch_payloads {
            size
        } else {
            records_end(nrec).min(size)
        };
        let mut buf = vec![0u8; want];
        let got = self.read(lsn, &mut buf)?;
        buf.truncate(got);

        let verify = self.fetch_payloads && self.source.verify_checksums();
        match LogBlock::decode(lsn, Bytes::from(buf), verify) {
            Ok(block) => Some(block),
            Err(reason) => {
                debug!(?lsn, %reason, "log scan stopped at invalid block");
                None
            }
        }
    }

    fn read(&mut self, lsn: Lsn, buf: &mut [u8]) -> Option<usize> {
        match self.source.read_log(lsn, buf) {
            Ok(n) => Some(n),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

/// Walks the non-control records of a log.
pub struct LogScanner<'a> {
    blocks: BlockScanner<'a>,
    idx: usize,
}

impl<'a> LogScanner<'a> {
    /// Positions a scanner on the first record at or after the block at `start`.
    pub fn new(source: &'a dyn LogSource, start: Lsn, follow_overflow: bool, fetch_payloads: bool) -> Self {
        let mut scanner = Self {
            blocks: BlockScanner::new(source, start, follow_overflow, fetch_payloads),
            idx: 0,
        };
        scanner.skip_control();
        scanner
    }

    /// Returns true while positioned on a record.
    pub fn valid(&self) -> bool {
        self.blocks.valid()
    }

    /// Moves to the next record.
    pub fn next(&mut self) {
        if self.valid() {
            self.idx += 1;
            self.skip_control();
        }
    }

    fn skip_control(&mut self) {
        while let Some(block) = self.blocks.block() {
            while self.idx < block.nrec() && block.records()[self.idx].rtype.is_control() {
                self.idx += 1;
            }
            if self.idx < block.nrec() {
                return;
            }
            self.blocks.next();
            self.idx = 0;
        }
    }

    /// The current block.
    pub fn block(&self) -> Option<&LogBlock> {
        self.blocks.block()
    }

    /// The current record entry.
    pub fn record(&self) -> Option<&LogRecord> {
        self.blocks.block().and_then(|b| b.record(self.idx))
    }

    /// Index of the current record within its block.
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Returns and clears an I/O error that ended the scan, if any.
    pub fn take_error(&mut self) -> Option<LogError> {
        self.blocks.take_error()
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Capability marker for [`Scan`] variants.
pub trait ScanKind: sealed::Sealed {
    /// Whether whole blocks, payloads included, are read.
    const FETCH_PAYLOADS: bool;
}

/// Header-only variant: payloads are read from the log on demand.
#[derive(Debug)]
pub enum Headers {}

/// Whole-block variant: payloads come straight from the scanned block.
#[derive(Debug)]
pub enum Records {}

impl sealed::Sealed for Headers {}
impl sealed::Sealed for Records {}

impl ScanKind for Headers {
    const FETCH_PAYLOADS: bool = false;
}

impl ScanKind for Records {
    const FETCH_PAYLOADS: bool = true;
}

/// Scans record headers, loading payloads only when asked.
pub type HeaderScan<'a> = Scan<'a, Headers>;

/// Scans whole records; can be limited to one transaction.
pub type RecordScan<'a> = Scan<'a, Records>;

/// A record cursor with payload helpers.
///
/// Accessors describe the current record and are only meaningful while
/// [`valid`](Self::valid) is true.
pub struct Scan<'a, K: ScanKind> {
    log: &'a LogShared,
    inner: LogScanner<'a>,
    limit: Option<Lsn>,
    _kind: PhantomData<K>,
}

impl<'a, K: ScanKind> Scan<'a, K> {
    fn new(log: &'a LogShared, start: Lsn, limit: Option<Lsn>) -> Self {
        Self {
            log,
            inner: LogScanner::new(log, start, true, K::FETCH_PAYLOADS),
            limit,
            _kind: PhantomData,
        }
    }

    /// Returns true while positioned on a record.
    pub fn valid(&self) -> bool {
        match (self.inner.block(), self.limit) {
            (Some(block), Some(limit)) => block.lsn().offset() <= limit.offset(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Moves to the next record.
    pub fn next(&mut self) {
        self.inner.next();
    }

    fn record(&self) -> Option<&LogRecord> {
        self.inner.record()
    }

    /// Raw record type.
    pub fn record_type(&self) -> Option<RecordType> {
        self.record().map(|r| r.rtype)
    }

    /// What the record means to replay.
    pub fn kind(&self) -> Option<RecordKind> {
        self.record_type().and_then(RecordType::kind)
    }

    /// File id.
    pub fn fid(&self) -> Fid {
        self.record().map_or(Fid::INVALID, |r| r.fid)
    }

    /// Object id.
    pub fn oid(&self) -> Oid {
        self.record().map_or(Oid::INVALID, |r| r.oid)
    }

    /// Size code of the described object.
    pub fn size_code(&self) -> SizeCode {
        self.record().map_or(SizeCode::ZERO, |r| r.size_code)
    }

    /// Alignment the size code is expressed in.
    pub fn align_bits(&self) -> u8 {
        self.record().map_or(0, |r| r.align_bits)
    }

    /// Decoded object size in bytes.
    pub fn payload_size(&self) -> LogResult<usize> {
        Ok(self.size_code().decode(self.align_bits())?)
    }

    /// Returns true if the payload is stored externally.
    pub fn is_ext(&self) -> bool {
        self.record().is_some_and(|r| r.rtype.is_ext())
    }

    /// Start of the containing block.
    pub fn block_lsn(&self) -> Lsn {
        self.inner.block().map_or(Lsn::INVALID, LogBlock::lsn)
    }

    /// End of the containing block.
    ///
    /// For a commit block this is the transaction's commit LSN.
    pub fn block_next_lsn(&self) -> Lsn {
        self.inner.block().map_or(Lsn::INVALID, LogBlock::next_lsn)
    }

    /// Returns true if the containing block was spilled ahead of its commit block.
    pub fn in_overflow_block(&self) -> bool {
        self.inner
            .block()
            .is_some_and(|b| b.first_type() == RecordType::FatSkip)
    }

    /// Where the inline payload starts, or invalid for records without one.
    pub fn payload_lsn(&self) -> Lsn {
        match (self.inner.block(), self.record()) {
            (Some(block), Some(record)) if record.rtype.has_payload() => block
                .lsn()
                .advance(block.payload_offset(self.inner.index()) as u64),
            _ => Lsn::INVALID,
        }
    }

    /// Pointer to the record's payload.
    ///
    /// For an external payload, `follow_ext` reads the stored pointer and
    /// returns the object's log location; otherwise an `External` pointer to
    /// the stored pointer is returned. Records without payload give null.
    pub fn payload_ptr(&self, follow_ext: bool) -> LogResult<TaggedPtr> {
        let lsn = self.payload_lsn();
        if !lsn.is_valid() {
            return Ok(TaggedPtr::NULL);
        }
        let code = self.size_code();
        if !self.is_ext() {
            return Ok(TaggedPtr::log(lsn, code));
        }
        let ext = TaggedPtr::external(lsn, code);
        if follow_ext {
            ScanManager::new(self.log).load_ext_pointer(ext)
        } else {
            Ok(ext)
        }
    }

    /// Returns and clears an I/O error that ended the scan, if any.
    pub fn take_error(&mut self) -> Option<LogError> {
        self.inner.take_error()
    }
}

impl<'a> Scan<'a, Headers> {
    /// Reads the record's object from the log.
    pub fn load_object(&self) -> LogResult<Bytes> {
        let ptr = self.payload_ptr(true)?;
        ScanManager::new(self.log).load_object(ptr, self.align_bits())
    }
}

impl<'a> Scan<'a, Records> {
    /// Inline payload bytes from the scanned block.
    pub fn payload(&self) -> Option<Bytes> {
        self.inner
            .block()
            .and_then(|b| b.payload(self.inner.index()))
    }

    /// The record's object, taken from the block unless stored externally.
    pub fn load_object(&self) -> LogResult<Bytes> {
        if !self.is_ext() {
            if let Some(payload) = self.payload() {
                return Ok(payload);
            }
        }
        let ptr = self.payload_ptr(true)?;
        ScanManager::new(self.log).load_object(ptr, self.align_bits())
    }
}

/// Entry point for scans and payload loads, handed to recovery functors.
#[derive(Clone, Copy)]
pub struct ScanManager<'a> {
    log: &'a LogShared,
}

impl<'a> ScanManager<'a> {
    pub(crate) fn new(log: &'a LogShared) -> Self {
        Self { log }
    }

    /// Header scan starting at the block at `start`.
    pub fn new_header_scan(&self, start: Lsn) -> HeaderScan<'a> {
        Scan::new(self.log, start, None)
    }

    /// Whole-record scan starting at the block at `start`.
    pub fn new_record_scan(&self, start: Lsn) -> RecordScan<'a> {
        Scan::new(self.log, start, None)
    }

    /// Scan of the transaction whose commit block starts at `start`.
    ///
    /// Surfaces the spilled blocks of the transaction, then the commit block
    /// itself, and stops.
    pub fn new_tx_scan(&self, start: Lsn) -> RecordScan<'a> {
        Scan::new(self.log, start, Some(start))
    }

    /// Raw record scanner.
    pub fn new_log_scan(&self, start: Lsn, fetch_payloads: bool) -> LogScanner<'a> {
        LogScanner::new(self.log, start, true, fetch_payloads)
    }

    /// Raw block scanner.
    pub fn new_block_scan(&self, start: Lsn, follow_overflow: bool) -> BlockScanner<'a> {
        BlockScanner::new(self.log, start, follow_overflow, true)
    }

    /// Reads the object `ptr` points at. `ptr` must be a log pointer.
    pub fn load_object(&self, ptr: TaggedPtr, align_bits: u8) -> LogResult<Bytes> {
        self.log.load_object(ptr, align_bits)
    }

    /// Resolves an external pointer to the log pointer stored behind it.
    pub fn load_ext_pointer(&self, ptr: TaggedPtr) -> LogResult<TaggedPtr> {
        self.log.load_ext_pointer(ptr)
    }
}

impl std::fmt::Debug for ScanManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanManager").finish_non_exhaustive()
    }
}
