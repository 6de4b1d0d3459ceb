//! Tagged pointers.
//!
//! A [`TaggedPtr`] is the fixed-width reference shared by the object store,
//! the log and checkpoints. The address-space tag decides how the offset is
//! interpreted, so callers go through [`TaggedPtr::decode`] or one of the
//! checked accessors rather than reading the offset directly.
//!
//! ```text
//! 63                              16 15        8 7     5 4       0
//! +--------------------------------+-----------+-------+---------+
//! |          offset (48)           | size code | space | seg tag |
//! +--------------------------------+-----------+-------+---------+
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{Lsn, Oid};
use super::size::SizeCode;
use crate::constants::{MAX_PTR_OFFSET, SEGMENT_TAG_MASK};
use crate::error::{AddrError, AddrResult};

/// The address spaces a tagged pointer can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddressSpace {
    /// Volatile memory owned by the object store.
    Memory = 1,
    /// A payload resident in the log.
    Log = 2,
    /// A payload resident in the checkpoint data file.
    Checkpoint = 3,
    /// A log location holding a pointer to the real payload.
    External = 4,
    /// A directory node listing further OIDs.
    Directory = 5,
}

impl AddressSpace {
    /// Returns the tag bits for this space.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses tag bits. Zero is the null pointer and maps to `None`.
    #[inline]
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Memory),
            2 => Some(Self::Log),
            3 => Some(Self::Checkpoint),
            4 => Some(Self::External),
            5 => Some(Self::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Log => "log",
            Self::Checkpoint => "checkpoint",
            Self::External => "external",
            Self::Directory => "directory",
        };
        f.write_str(name)
    }
}

/// A decoded tagged pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// The null pointer.
    Null,
    /// A volatile object handle.
    Memory {
        /// Opaque handle of the in-memory object.
        handle: u64,
        /// Size class of the object.
        size: SizeCode,
    },
    /// A payload in the log.
    Log {
        /// Position of the payload.
        lsn: Lsn,
        /// Size class of the payload.
        size: SizeCode,
    },
    /// A payload in the checkpoint data file.
    Checkpoint {
        /// Byte offset in the checkpoint data file.
        offset: u64,
        /// Size class of the payload.
        size: SizeCode,
    },
    /// A log location holding the real payload's pointer.
    External {
        /// Position of the stored pointer.
        lsn: Lsn,
        /// Size class of the referenced payload.
        size: SizeCode,
    },
    /// A directory node owned by the given OID.
    Directory {
        /// OID whose slot holds the directory.
        oid: Oid,
    },
}

/// A 64-bit reference tagged with its address space and size class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TaggedPtr(u64);

impl TaggedPtr {
    /// The null pointer.
    pub const NULL: Self = Self(0);

    const SPACE_SHIFT: u32 = 5;
    const SPACE_MASK: u64 = 0x7;
    const SIZE_SHIFT: u32 = 8;
    const OFFSET_SHIFT: u32 = 16;

    /// Builds a pointer from its fields.
    pub fn make(space: AddressSpace, offset: u64, size: SizeCode, seg_tag: u32) -> AddrResult<Self> {
        if offset > MAX_PTR_OFFSET {
            return Err(AddrError::OffsetOverflow { offset });
        }
        Ok(Self::pack(space, offset, size, seg_tag))
    }

    #[inline]
    const fn pack(space: AddressSpace, offset: u64, size: SizeCode, seg_tag: u32) -> Self {
        Self(
            (offset << Self::OFFSET_SHIFT)
                | ((size.as_u8() as u64) << Self::SIZE_SHIFT)
                | ((space.as_u8() as u64) << Self::SPACE_SHIFT)
                | (seg_tag as u64 & SEGMENT_TAG_MASK),
        )
    }

    /// A pointer to a log-resident payload at `lsn`.
    #[inline]
    #[must_use]
    pub const fn log(lsn: Lsn, size: SizeCode) -> Self {
        Self::pack(AddressSpace::Log, lsn.offset(), size, lsn.segment())
    }

    /// A pointer to the stored pointer at `lsn`.
    #[inline]
    #[must_use]
    pub const fn external(lsn: Lsn, size: SizeCode) -> Self {
        Self::pack(AddressSpace::External, lsn.offset(), size, lsn.segment())
    }

    /// A pointer into the checkpoint data file.
    pub fn checkpoint(offset: u64, size: SizeCode) -> AddrResult<Self> {
        Self::make(AddressSpace::Checkpoint, offset, size, 0)
    }

    /// A pointer to a volatile object.
    pub fn memory(handle: u64, size: SizeCode) -> AddrResult<Self> {
        Self::make(AddressSpace::Memory, handle, size, 0)
    }

    /// A pointer to the directory node held in `oid`'s slot.
    #[inline]
    #[must_use]
    pub const fn directory(oid: Oid) -> Self {
        Self::pack(AddressSpace::Directory, oid.as_u32() as u64, SizeCode::ZERO, 0)
    }

    /// Wraps a raw value.
    #[inline]
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks for the null pointer.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address space, or `None` for null and unknown tags.
    #[inline]
    #[must_use]
    pub const fn space(self) -> Option<AddressSpace> {
        AddressSpace::from_u8(((self.0 >> Self::SPACE_SHIFT) & Self::SPACE_MASK) as u8)
    }

    /// Returns the size class.
    #[inline]
    #[must_use]
    pub const fn size_code(self) -> SizeCode {
        SizeCode::from_u8((self.0 >> Self::SIZE_SHIFT) as u8)
    }

    /// Returns the raw offset field. Its meaning depends on the space.
    #[inline]
    #[must_use]
    pub const fn raw_offset(self) -> u64 {
        self.0 >> Self::OFFSET_SHIFT
    }

    #[inline]
    const fn seg_tag(self) -> u32 {
        (self.0 & SEGMENT_TAG_MASK) as u32
    }

    /// Decodes into an [`Address`].
    pub fn decode(self) -> AddrResult<Address> {
        if self.is_null() {
            return Ok(Address::Null);
        }
        let tag = ((self.0 >> Self::SPACE_SHIFT) & Self::SPACE_MASK) as u8;
        let size = self.size_code();
        let offset = self.raw_offset();
        let addr = match AddressSpace::from_u8(tag) {
            Some(AddressSpace::Memory) => Address::Memory { handle: offset, size },
            Some(AddressSpace::Log) => Address::Log {
                lsn: Lsn::make(offset, self.seg_tag()),
                size,
            },
            Some(AddressSpace::Checkpoint) => Address::Checkpoint { offset, size },
            Some(AddressSpace::External) => Address::External {
                lsn: Lsn::make(offset, self.seg_tag()),
                size,
            },
            Some(AddressSpace::Directory) => Address::Directory {
                oid: Oid::new(offset as u32),
            },
            None => return Err(AddrError::UnknownSpace { tag, raw: self.0 }),
        };
        Ok(addr)
    }

    /// Fails unless the pointer is in `expected`.
    pub fn expect_space(self, expected: AddressSpace) -> AddrResult<Self> {
        match self.space() {
            Some(space) if space == expected => Ok(self),
            found => Err(AddrError::wrong_space(expected, found)),
        }
    }

    /// Returns the LSN of a log pointer.
    pub fn as_lsn(self) -> AddrResult<Lsn> {
        self.expect_space(AddressSpace::Log)?;
        Ok(Lsn::make(self.raw_offset(), self.seg_tag()))
    }

    /// Returns the LSN of the stored pointer behind an external pointer.
    pub fn as_ext_lsn(self) -> AddrResult<Lsn> {
        self.expect_space(AddressSpace::External)?;
        Ok(Lsn::make(self.raw_offset(), self.seg_tag()))
    }

    /// Returns the file offset of a checkpoint pointer.
    pub fn checkpoint_offset(self) -> AddrResult<u64> {
        self.expect_space(AddressSpace::Checkpoint)?;
        Ok(self.raw_offset())
    }

    /// Returns the OID owning a directory pointer.
    pub fn directory_oid(self) -> AddrResult<Oid> {
        self.expect_space(AddressSpace::Directory)?;
        Ok(Oid::new(self.raw_offset() as u32))
    }

    /// Converts an external pointer into a log pointer to its 8-byte slot.
    pub fn ext_slot(self) -> AddrResult<Self> {
        let lsn = self.as_ext_lsn()?;
        Ok(Self::log(lsn, SizeCode::encode(8, 0)))
    }

    /// Returns the payload size in bytes for the given alignment.
    pub fn size(self, align_bits: u8) -> AddrResult<usize> {
        self.size_code().decode(align_bits)
    }
}

impl fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(Address::Null) => write!(f, "TaggedPtr(NULL)"),
            Ok(addr) => write!(f, "TaggedPtr({addr:?})"),
            Err(_) => write!(f, "TaggedPtr({:#018x})", self.0),
        }
    }
}

impl From<Lsn> for TaggedPtr {
    /// A zero-sized log pointer. Used to carry commit LSNs.
    fn from(lsn: Lsn) -> Self {
        Self::log(lsn, SizeCode::ZERO)
    }
}
