//! Log record types, flags and the fixed-size record entry.

use bytes::{Buf, BufMut, Bytes};

use sable_common::constants::LOG_RECORD_SIZE;
use sable_common::types::align_up;
use sable_common::{AddrResult, Fid, Lsn, Oid, SizeCode};

bitflags::bitflags! {
    /// Flag bits carried in the high nibble of a record type byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u8 {
        /// Record has an inline payload following the record array.
        const HAS_PAYLOAD = 0b0001_0000;
        /// Inline payload is a pointer to an externally stored object.
        const IS_EXT = 0b0010_0000;
        /// Data field holds an LSN rather than a payload offset.
        const HAS_LSN = 0b0100_0000;
    }
}

/// On-disk record type. The high nibble holds [`RecordFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Padding record.
    Nop = 0x40,
    /// Free-form payload, also used to hold external objects.
    Comment = 0x51,
    /// Leads a commit block; names the last spilled block of the transaction.
    Overflow = 0x42,
    /// Leads a block that holds nothing; scans pass over it.
    Skip = 0x43,
    /// Leads a block reachable only through a chain (spill or external data).
    FatSkip = 0x44,
    /// New object.
    Insert = 0x11,
    /// New object whose payload is stored externally.
    InsertExt = 0x31,
    /// New index entry.
    InsertIndex = 0x12,
    /// New version of an existing object.
    Update = 0x13,
    /// New version stored externally.
    UpdateExt = 0x33,
    /// Key change of an index entry.
    UpdateKey = 0x14,
    /// Object moved to an already durable location.
    Relocate = 0x35,
    /// Object deleted.
    Delete = 0x06,
    /// Object deleted, with the deleted image as payload.
    EnhancedDelete = 0x17,
    /// File (table) creation, payload is the file name.
    Fid = 0x18,
}

impl RecordType {
    /// Converts the record type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record type from a u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x40 => Self::Nop,
            0x51 => Self::Comment,
            0x42 => Self::Overflow,
            0x43 => Self::Skip,
            0x44 => Self::FatSkip,
            0x11 => Self::Insert,
            0x31 => Self::InsertExt,
            0x12 => Self::InsertIndex,
            0x13 => Self::Update,
            0x33 => Self::UpdateExt,
            0x14 => Self::UpdateKey,
            0x35 => Self::Relocate,
            0x06 => Self::Delete,
            0x17 => Self::EnhancedDelete,
            0x18 => Self::Fid,
            _ => return None,
        })
    }

    /// Flag bits of this type.
    pub const fn flags(self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self as u8 & 0xf0)
    }

    /// Control records structure the log and are never replayed.
    pub const fn is_control(self) -> bool {
        self.flags().contains(RecordFlags::HAS_LSN)
    }

    /// Returns true if this record has an inline payload.
    pub const fn has_payload(self) -> bool {
        self.flags().contains(RecordFlags::HAS_PAYLOAD)
    }

    /// Returns true if this record's payload is an external pointer.
    pub const fn is_ext(self) -> bool {
        self.flags().contains(RecordFlags::IS_EXT)
    }

    /// The replayable kind, or `None` for control records.
    pub const fn kind(self) -> Option<RecordKind> {
        Some(match self {
            Self::Insert | Self::InsertExt => RecordKind::Insert,
            Self::InsertIndex => RecordKind::InsertIndex,
            Self::Update | Self::UpdateExt => RecordKind::Update,
            Self::UpdateKey => RecordKind::UpdateKey,
            Self::Relocate => RecordKind::Relocate,
            Self::Delete => RecordKind::Delete,
            Self::EnhancedDelete => RecordKind::EnhancedDelete,
            Self::Fid => RecordKind::Fid,
            Self::Nop | Self::Comment | Self::Overflow | Self::Skip | Self::FatSkip => {
                return None
            }
        })
    }
}

/// What a non-control record means to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Object created.
    Insert,
    /// Index entry created.
    InsertIndex,
    /// Object updated.
    Update,
    /// Index key updated.
    UpdateKey,
    /// Object relocated.
    Relocate,
    /// Object deleted.
    Delete,
    /// Object deleted with its image logged.
    EnhancedDelete,
    /// File created.
    Fid,
}

/// A fixed-size record entry as stored in a block.
///
/// Layout (24 bytes, big-endian):
/// - type: 1 byte
/// - size_code: 1 byte
/// - align_bits: 1 byte
/// - reserved: 1 byte
/// - fid: 4 bytes
/// - oid: 4 bytes
/// - reserved: 4 bytes
/// - data: 8 bytes (payload end within the block, or an LSN)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    /// Record type.
    pub rtype: RecordType,
    /// Size code of the object the record describes.
    pub size_code: SizeCode,
    /// Alignment the size code is expressed in.
    pub align_bits: u8,
    /// File id.
    pub fid: Fid,
    /// Object id.
    pub oid: Oid,
    /// Payload end offset or predecessor LSN.
    pub data: u64,
}

impl LogRecord {
    /// Size of an encoded record entry.
    pub const SIZE: usize = LOG_RECORD_SIZE;

    /// Serializes the record entry.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.rtype.as_u8());
        buf.put_u8(self.size_code.as_u8());
        buf.put_u8(self.align_bits);
        buf.put_u8(0);
        buf.put_u32(self.fid.as_u32());
        buf.put_u32(self.oid.as_u32());
        buf.put_u32(0);
        buf.put_u64(self.data);
    }

    /// Deserializes a record entry. Returns `None` for an unknown type.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        let rtype = RecordType::from_u8(buf.get_u8())?;
        let size_code = SizeCode::from_u8(buf.get_u8());
        let align_bits = buf.get_u8();
        buf.advance(1);
        let fid = Fid::new(buf.get_u32());
        let oid = Oid::new(buf.get_u32());
        buf.advance(4);
        let data = buf.get_u64();
        Some(Self {
            rtype,
            size_code,
            align_bits,
            fid,
            oid,
            data,
        })
    }

    /// Predecessor LSN carried by control records.
    pub fn chain_lsn(&self) -> Lsn {
        if self.rtype.is_control() {
            Lsn::from_u64(self.data)
        } else {
            Lsn::INVALID
        }
    }
}

/// A record to be placed into a new block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpec {
    /// Record type.
    pub rtype: RecordType,
    /// File id.
    pub fid: Fid,
    /// Object id.
    pub oid: Oid,
    /// Alignment of the size code.
    pub align_bits: u8,
    /// Size code of the described object.
    pub size_code: SizeCode,
    /// Inline payload bytes.
    pub payload: Option<Bytes>,
    /// Predecessor LSN for chain records.
    pub chain: Lsn,
}

impl RecordSpec {
    /// A record with an inline payload sized by its own length.
    pub fn with_payload(rtype: RecordType, fid: Fid, oid: Oid, payload: Bytes, align_bits: u8) -> Self {
        Self {
            rtype,
            fid,
            oid,
            align_bits,
            size_code: SizeCode::encode(payload.len(), align_bits),
            payload: Some(payload),
            chain: Lsn::INVALID,
        }
    }

    /// A record whose inline payload is an external pointer to an object of `size_code`.
    pub fn external(
        rtype: RecordType,
        fid: Fid,
        oid: Oid,
        pointer: u64,
        size_code: SizeCode,
        align_bits: u8,
    ) -> Self {
        Self {
            rtype,
            fid,
            oid,
            align_bits,
            size_code,
            payload: Some(Bytes::copy_from_slice(&pointer.to_be_bytes())),
            chain: Lsn::INVALID,
        }
    }

    /// A record with no payload.
    pub fn bare(rtype: RecordType, fid: Fid, oid: Oid) -> Self {
        Self {
            rtype,
            fid,
            oid,
            align_bits: 0,
            size_code: SizeCode::ZERO,
            payload: None,
            chain: Lsn::INVALID,
        }
    }

    /// A control record naming a predecessor block.
    pub fn chain(rtype: RecordType, prev: Lsn) -> Self {
        Self {
            chain: prev,
            ..Self::bare(rtype, Fid::INVALID, Oid::INVALID)
        }
    }

    /// Bytes this record's payload occupies in a block.
    ///
    /// Inline objects are padded to their decoded size so that a pointer
    /// carrying the size code never reads past the block.
    pub fn padded_len(&self) -> AddrResult<usize> {
        match &self.payload {
            None => Ok(0),
            Some(p) if self.rtype.is_ext() => align_up(p.len(), self.align_bits),
            Some(p) => Ok(self.size_code.decode(self.align_bits)?.max(p.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_record_type_flags() {
        assert!(RecordType::Skip.is_control());
        assert!(RecordType::FatSkip.is_control());
        assert!(RecordType::Overflow.is_control());
        assert!(RecordType::Comment.is_control());
        assert!(RecordType::Comment.has_payload());
        assert!(!RecordType::Insert.is_control());
        assert!(RecordType::InsertExt.is_ext());
        assert!(RecordType::Relocate.is_ext());
        assert!(!RecordType::Delete.has_payload());
        assert_eq!(RecordType::UpdateExt.kind(), Some(RecordKind::Update));
        assert_eq!(RecordType::Nop.kind(), None);
    }

    #[test]
    fn test_record_type_from_u8() {
        for t in [
            RecordType::Nop,
            RecordType::Comment,
            RecordType::Overflow,
            RecordType::Skip,
            RecordType::FatSkip,
            RecordType::Insert,
            RecordType::InsertExt,
            RecordType::InsertIndex,
            RecordType::Update,
            RecordType::UpdateExt,
            RecordType::UpdateKey,
            RecordType::Relocate,
            RecordType::Delete,
            RecordType::EnhancedDelete,
            RecordType::Fid,
        ] {
            assert_eq!(RecordType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(RecordType::from_u8(0xee), None);
    }

    #[test]
    fn test_record_entry_layout() {
        let record = LogRecord {
            rtype: RecordType::Update,
            size_code: SizeCode::encode(100, 4),
            align_bits: 4,
            fid: Fid::new(7),
            oid: Oid::new(42),
            data: 0x1234,
        };
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        assert_eq!(buf.len(), LogRecord::SIZE);
        assert_eq!(buf[0], RecordType::Update.as_u8());

        let decoded = LogRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.chain_lsn(), Lsn::INVALID);
    }

    #[test]
    fn test_padded_len() {
        let spec = RecordSpec::with_payload(
            RecordType::Insert,
            Fid::new(3),
            Oid::new(1),
            Bytes::from_static(&[1u8; 20]),
            4,
        );
        assert_eq!(spec.padded_len().unwrap(), 32);

        let ext = RecordSpec::external(
            RecordType::InsertExt,
            Fid::new(3),
            Oid::new(1),
            0xdead_beef,
            SizeCode::encode(200_000, 4),
            4,
        );
        assert_eq!(ext.padded_len().unwrap(), 16);

        assert_eq!(RecordSpec::chain(RecordType::Overflow, Lsn::make(48, 1)).padded_len().unwrap(), 0);
    }
}
