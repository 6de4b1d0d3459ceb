//! Log block codec.
//!
//! A block is the unit of allocation and validation in the log:
//!
//! ```text
//! +-----------+-----------+---------------+-------------+
//! | header 24 | records   | payloads      | zero pad    |
//! |           | nrec * 24 | padded, dense | to next_lsn |
//! +-----------+-----------+---------------+-------------+
//! ```
//!
//! A payload record's data field is the end offset of its payload within the
//! block; its payload starts where the previous payload ended.

pub mod header;
pub mod record;

use bytes::{BufMut, Bytes, BytesMut};

use sable_common::constants::{MAX_BLOCK_RECORDS, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use sable_common::Lsn;

use crate::error::{LogError, LogResult};

pub use header::{block_checksum, BlockHeader};
pub use record::{LogRecord, RecordFlags, RecordKind, RecordSpec, RecordType};

/// Bytes needed to hold `specs` in one block.
pub fn block_size(specs: &[RecordSpec]) -> LogResult<usize> {
    let mut size = records_end(specs.len());
    for spec in specs {
        size += spec.padded_len()?;
    }
    if size > MAX_BLOCK_SIZE {
        return Err(LogError::BlockTooLarge {
            size,
            max: MAX_BLOCK_SIZE,
        });
    }
    Ok(size)
}

/// Offset within the block where each record's payload starts.
pub fn payload_offsets(specs: &[RecordSpec]) -> LogResult<Vec<usize>> {
    let mut at = records_end(specs.len());
    let mut offsets = Vec::with_capacity(specs.len());
    for spec in specs {
        offsets.push(at);
        at += spec.padded_len()?;
    }
    Ok(offsets)
}

pub(crate) fn records_end(nrec: usize) -> usize {
    BlockHeader::SIZE + nrec * LogRecord::SIZE
}

/// Serializes a block spanning `[lsn, next_lsn)`.
///
/// Space between the last payload and `next_lsn` is zero-filled.
pub fn encode_block(lsn: Lsn, next_lsn: Lsn, specs: &[RecordSpec]) -> LogResult<Bytes> {
    let size = (next_lsn.offset() - lsn.offset()) as usize;
    let needed = block_size(specs)?;
    if specs.is_empty() || specs.len() > MAX_BLOCK_RECORDS || size < needed {
        return Err(LogError::invariant(format!(
            "cannot lay out {} records ({needed} bytes) in a {size}-byte block",
            specs.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(size);
    BlockHeader {
        lsn,
        nrec: specs.len() as u32,
        checksum: 0,
        next_lsn,
    }
    .encode(&mut buf);

    let mut payload_end = records_end(specs.len());
    for spec in specs {
        let data = if spec.rtype.has_payload() {
            payload_end += spec.padded_len()?;
            payload_end as u64
        } else {
            spec.chain.as_u64()
        };
        LogRecord {
            rtype: spec.rtype,
            size_code: spec.size_code,
            align_bits: spec.align_bits,
            fid: spec.fid,
            oid: spec.oid,
            data,
        }
        .encode(&mut buf);
    }

    for spec in specs {
        if let Some(payload) = spec.payload.as_ref().filter(|_| spec.rtype.has_payload()) {
            buf.put_slice(payload);
            buf.put_bytes(0, spec.padded_len()? - payload.len());
        }
    }
    buf.resize(size, 0);

    let checksum = block_checksum(&buf);
    buf[BlockHeader::CHECKSUM_RANGE].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf.freeze())
}

/// A block holding a single `Skip` record over `[lsn, next_lsn)`.
pub fn encode_skip(lsn: Lsn, next_lsn: Lsn) -> LogResult<Bytes> {
    encode_block(lsn, next_lsn, &[RecordSpec::chain(RecordType::Skip, Lsn::INVALID)])
}

/// A validated block read back from the log.
#[derive(Clone)]
pub struct LogBlock {
    bytes: Bytes,
    header: BlockHeader,
    records: Vec<LogRecord>,
    payload_starts: Vec<usize>,
}

impl LogBlock {
    /// Validates `bytes` as the block at `expected`.
    ///
    /// `bytes` must hold at least the header and record array. Payloads and
    /// the checksum are checked only when the whole block is present.
    pub fn decode(expected: Lsn, mut bytes: Bytes, verify_checksum: bool) -> Result<Self, String> {
        let header = BlockHeader::decode(&bytes).ok_or("short block header")?;
        if header.lsn != expected {
            return Err(format!("block claims {:?}", header.lsn));
        }
        let nrec = header.nrec as usize;
        if nrec == 0 || nrec > MAX_BLOCK_RECORDS {
            return Err(format!("bad record count {nrec}"));
        }
        let size = header.block_size().ok_or("next lsn does not follow block")?;
        let records_end = records_end(nrec);
        // A rollover skip block may exceed the maximum by less than a minimal block.
        if size > MAX_BLOCK_SIZE + MIN_BLOCK_SIZE || size < records_end {
            return Err(format!("bad block size {size}"));
        }
        if bytes.len() < records_end {
            return Err("short record array".to_string());
        }
        bytes.truncate(size);

        if verify_checksum {
            if bytes.len() < size {
                return Err("short block".to_string());
            }
            let computed = block_checksum(&bytes);
            if computed != header.checksum {
                return Err(format!(
                    "checksum mismatch: stored {:#010x}, computed {computed:#010x}",
                    header.checksum
                ));
            }
        }

        let mut cursor = bytes.slice(BlockHeader::SIZE..records_end);
        let mut records = Vec::with_capacity(nrec);
        let mut payload_starts = Vec::with_capacity(nrec);
        let mut payload_at = records_end;
        for _ in 0..nrec {
            let record = LogRecord::decode(&mut cursor).ok_or("unknown record type")?;
            payload_starts.push(payload_at);
            if record.rtype.has_payload() {
                let end = usize::try_from(record.data).map_err(|_| "payload end overflow")?;
                if end < payload_at || end > size {
                    return Err(format!("payload end {end} out of bounds"));
                }
                payload_at = end;
            }
            records.push(record);
        }

        Ok(Self {
            bytes,
            header,
            records,
            payload_starts,
        })
    }

    /// LSN of this block.
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    /// LSN of the following block.
    pub fn next_lsn(&self) -> Lsn {
        self.header.next_lsn
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        (self.header.next_lsn.offset() - self.header.lsn.offset()) as usize
    }

    /// Number of records.
    pub fn nrec(&self) -> usize {
        self.records.len()
    }

    /// All record entries.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Record entry `idx`.
    pub fn record(&self, idx: usize) -> Option<&LogRecord> {
        self.records.get(idx)
    }

    /// Type of the leading record.
    pub fn first_type(&self) -> RecordType {
        self.records[0].rtype
    }

    /// Predecessor named by the leading record, for chained blocks.
    pub fn chain_lsn(&self) -> Lsn {
        self.records[0].chain_lsn()
    }

    /// Offset within the block where record `idx`'s payload starts.
    pub fn payload_offset(&self, idx: usize) -> usize {
        self.payload_starts[idx]
    }

    /// Inline payload of record `idx`, if present and loaded.
    pub fn payload(&self, idx: usize) -> Option<Bytes> {
        let record = self.records.get(idx)?;
        if !record.rtype.has_payload() {
            return None;
        }
        let (start, end) = (self.payload_starts[idx], record.data as usize);
        (end <= self.bytes.len()).then(|| self.bytes.slice(start..end))
    }

    /// Returns true if the whole block, payloads included, was read.
    pub fn is_complete(&self) -> bool {
        self.bytes.len() == self.size()
    }

    /// Raw block bytes as read.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl std::fmt::Debug for LogBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBlock")
            .field("lsn", &self.lsn())
            .field("next_lsn", &self.next_lsn())
            .field("nrec", &self.nrec())
            .field("complete", &self.is_complete())
            .finish()
    }
}
