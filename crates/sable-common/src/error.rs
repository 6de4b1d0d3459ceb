//! Addressing errors.
//!
//! Using a tagged pointer in the wrong address space, or asking for a payload
//! larger than the destination buffer, is reported to the immediate caller.
//! Nothing here is fatal; the caller retries with correct usage.

use thiserror::Error;

use crate::types::AddressSpace;

/// Result type for addressing operations.
pub type AddrResult<T> = Result<T, AddrError>;

/// Errors raised when decoding or interpreting tagged pointers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    /// The pointer lives in a different address space than the caller expected.
    #[error("address space mismatch: expected {expected}, found {found}")]
    WrongSpace {
        /// Space the caller asked for.
        expected: AddressSpace,
        /// Space encoded in the pointer (`None` for the null pointer).
        found: SpaceName,
    },

    /// The address-space bits do not name any known space.
    #[error("unknown address space tag {tag:#x} in pointer {raw:#018x}")]
    UnknownSpace {
        /// The raw tag bits.
        tag: u8,
        /// The raw pointer.
        raw: u64,
    },

    /// The size code is the invalid marker or does not fit the requested alignment.
    #[error("invalid size code {code:#04x}")]
    InvalidSizeCode {
        /// The offending code.
        code: u8,
    },

    /// The destination is smaller than the object the pointer references.
    #[error("buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall {
        /// Bytes the object occupies.
        needed: usize,
        /// Bytes the caller supplied.
        available: usize,
    },

    /// The offset does not fit the 48-bit offset field.
    #[error("offset {offset:#x} does not fit in a tagged pointer")]
    OffsetOverflow {
        /// The offending offset.
        offset: u64,
    },
}

/// Display helper for the found side of a space mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceName(pub Option<AddressSpace>);

impl std::fmt::Display for SpaceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(space) => write!(f, "{space}"),
            None => write!(f, "null"),
        }
    }
}

impl AddrError {
    /// Creates a wrong-space error.
    #[must_use]
    pub fn wrong_space(expected: AddressSpace, found: Option<AddressSpace>) -> Self {
        Self::WrongSpace {
            expected,
            found: SpaceName(found),
        }
    }

    /// Creates a buffer-too-small error.
    #[must_use]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Self::BufferTooSmall { needed, available }
    }
}
