//! Compact size classes.
//!
//! A size code packs a byte count into one byte, rounded up to a multiple of
//! `1 << align_bits`. Small sizes are exact; large sizes keep three mantissa
//! bits, so rounding never exceeds 12.5%.
//!
//! ```text
//! code 0x00..=0x7f   units = code
//! code 0x80..=0xfe   units = (8 | code & 7) << ((code - 0x80) >> 3) + 4
//! code 0xff          invalid
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AddrError, AddrResult};

/// An encoded size class.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SizeCode(u8);

impl SizeCode {
    /// Marker for sizes that cannot be encoded.
    pub const INVALID: Self = Self(0xff);

    /// The zero-length size class.
    pub const ZERO: Self = Self(0);

    const EXACT_LIMIT: u64 = 0x80;

    /// Wraps a raw code.
    #[inline]
    #[must_use]
    pub const fn from_u8(code: u8) -> Self {
        Self(code)
    }

    /// Returns the raw code.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Checks if this is an encodable size class.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Encodes `nbytes`, rounding up to the alignment and then to the size class.
    ///
    /// Returns [`SizeCode::INVALID`] when the size is too large to encode or
    /// the alignment is wider than 64 bits.
    #[must_use]
    pub fn encode(nbytes: usize, align_bits: u8) -> Self {
        let Some(unit) = shift_units(1, align_bits) else {
            return Self::INVALID;
        };
        let units = (nbytes as u64).div_ceil(unit);
        if units < Self::EXACT_LIMIT {
            return Self(units as u8);
        }

        let bitlen = 64 - units.leading_zeros();
        let mut exp = bitlen.saturating_sub(8);
        let mut mantissa = units.div_ceil(1 << (exp + 4));
        if mantissa > 15 {
            exp += 1;
            mantissa = units.div_ceil(1 << (exp + 4));
        }
        debug_assert!((8..=15).contains(&mantissa));

        let code = Self::EXACT_LIMIT + (u64::from(exp) << 3) + (mantissa - 8);
        if code >= u64::from(Self::INVALID.0) {
            Self::INVALID
        } else {
            Self(code as u8)
        }
    }

    /// Decodes to a byte count for the given alignment.
    pub fn decode(self, align_bits: u8) -> AddrResult<usize> {
        if !self.is_valid() {
            return Err(AddrError::InvalidSizeCode { code: self.0 });
        }
        let code = u64::from(self.0);
        let units = if code < Self::EXACT_LIMIT {
            code
        } else {
            let exp = (code - Self::EXACT_LIMIT) >> 3;
            let mantissa = 8 | (code & 7);
            mantissa << (exp + 4)
        };
        shift_units(units, align_bits)
            .and_then(|nbytes| usize::try_from(nbytes).ok())
            .ok_or(AddrError::InvalidSizeCode { code: self.0 })
    }
}

impl Default for SizeCode {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for SizeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "SizeCode({:#04x})", self.0)
        } else {
            write!(f, "SizeCode(INVALID)")
        }
    }
}

/// `units << align_bits`, or `None` if any bit would be shifted out.
fn shift_units(units: u64, align_bits: u8) -> Option<u64> {
    let shift = u32::from(align_bits);
    units.checked_shl(shift).filter(|v| v >> shift == units)
}

/// Rounds `nbytes` up to a multiple of `1 << align_bits`.
///
/// Fails when the alignment or the rounded size does not fit a `usize`.
#[inline]
pub fn align_up(nbytes: usize, align_bits: u8) -> AddrResult<usize> {
    let overflow = AddrError::InvalidSizeCode {
        code: SizeCode::INVALID.as_u8(),
    };
    let unit = 1usize.checked_shl(u32::from(align_bits)).ok_or(overflow.clone())?;
    let mask = unit - 1;
    nbytes.checked_add(mask).map(|n| n & !mask).ok_or(overflow)
}
