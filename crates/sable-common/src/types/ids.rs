//! Core identifier types.
//!
//! Type-safe wrappers around the numeric identifiers used across the engine,
//! so a file id can never be passed where an OID is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{SEGMENT_TAG_BITS, SEGMENT_TAG_MASK};

/// Log sequence number - a position in the logical log.
///
/// An LSN is a byte offset into the logical log combined with the low bits of
/// the number of the segment holding that offset:
///
/// ```text
///  63                           16 15         5 4        0
/// +-------------------------------+------------+----------+
/// |        offset (48 bits)       |   unused   | seg tag  |
/// +-------------------------------+------------+----------+
/// ```
///
/// The segment tag occupies the low `SEGMENT_TAG_BITS` (5) bits. Bits 5..16
/// are always zero.
///
/// Ordering follows the offset. The segment tag lets a reader check that the
/// segment it resolved for the offset is the one the writer used.
///
/// # Example
///
/// ```rust
/// use sable_common::types::Lsn;
///
/// let lsn = Lsn::make(8192, 3);
/// assert_eq!(lsn.offset(), 8192);
/// assert_eq!(lsn.segment(), 3);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Invalid LSN, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// Largest representable LSN.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates an LSN from an offset and the number of the segment holding it.
    #[inline]
    #[must_use]
    pub const fn make(offset: u64, segnum: u32) -> Self {
        Self((offset << 16) | (segnum as u64 & SEGMENT_TAG_MASK))
    }

    /// Wraps a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the byte offset in the logical log.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 >> 16
    }

    /// Returns the segment tag (segment number modulo `2^SEGMENT_TAG_BITS`).
    #[inline]
    #[must_use]
    pub const fn segment(self) -> u32 {
        (self.0 & SEGMENT_TAG_MASK) as u32
    }

    /// Returns true if `segnum` carries this LSN's segment tag.
    #[inline]
    #[must_use]
    pub const fn in_segment(self, segnum: u32) -> bool {
        self.segment() == segnum % (1 << SEGMENT_TAG_BITS)
    }

    /// Returns the LSN `nbytes` further along in the same segment.
    #[inline]
    #[must_use]
    pub const fn advance(self, nbytes: u64) -> Self {
        Self::make(self.offset() + nbytes, self.segment())
    }

    /// Checks if this is a valid LSN.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Lsn(INVALID)")
        } else {
            write!(f, "Lsn({:#x}@{})", self.offset(), self.segment())
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.offset())
    }
}

impl From<Lsn> for u64 {
    #[inline]
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// File identifier - selects one OID slot array.
///
/// FIDs are allocated monotonically and never reused while referenced.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Fid(u32);

impl Fid {
    /// Invalid file ID.
    pub const INVALID: Self = Self(0);

    /// Creates a new `Fid`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a valid file ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fid({})", self.0)
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Fid {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Object identifier - an index into a file's slot array.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Oid(u32);

impl Oid {
    /// Invalid object ID.
    pub const INVALID: Self = Self(u32::MAX);

    /// Creates a new `Oid`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks if this is a valid object ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Oid(INVALID)")
        } else {
            write!(f, "Oid({})", self.0)
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Oid {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Transaction identifier, unique for the lifetime of an engine instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Xid(u64);

impl Xid {
    /// Invalid transaction ID.
    pub const INVALID: Self = Self(0);

    /// Creates a new `Xid`.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({})", self.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
