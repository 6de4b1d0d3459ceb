//! Block header.

use bytes::{Buf, BufMut};

use sable_common::constants::BLOCK_HEADER_SIZE;
use sable_common::Lsn;

/// Block header (24 bytes).
///
/// Layout:
/// - lsn: 8 bytes (where the block lives)
/// - nrec: 4 bytes (number of record entries)
/// - checksum: 4 bytes (CRC-32 of the block with this field zeroed)
/// - next_lsn: 8 bytes (LSN of the following block)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// LSN of this block.
    pub lsn: Lsn,
    /// Number of records.
    pub nrec: u32,
    /// Block checksum.
    pub checksum: u32,
    /// LSN of the next block.
    pub next_lsn: Lsn,
}

impl BlockHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = BLOCK_HEADER_SIZE;

    /// Byte range of the checksum field.
    pub const CHECKSUM_RANGE: std::ops::Range<usize> = 12..16;

    /// Serializes the header.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.lsn.as_u64());
        buf.put_u32(self.nrec);
        buf.put_u32(self.checksum);
        buf.put_u64(self.next_lsn.as_u64());
    }

    /// Deserializes a header from the first 24 bytes of `buf`.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            lsn: Lsn::from_u64(buf.get_u64()),
            nrec: buf.get_u32(),
            checksum: buf.get_u32(),
            next_lsn: Lsn::from_u64(buf.get_u64()),
        })
    }

    /// Total block size implied by `next_lsn`, if it lies after `lsn`.
    pub fn block_size(&self) -> Option<usize> {
        self.next_lsn
            .offset()
            .checked_sub(self.lsn.offset())
            .filter(|&n| n > 0)
            .and_then(|n| usize::try_from(n).ok())
    }
}

/// CRC-32 of a serialized block, treating the checksum field as zero.
pub fn block_checksum(block: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block[..BlockHeader::CHECKSUM_RANGE.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&block[BlockHeader::CHECKSUM_RANGE.end..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = BlockHeader {
            lsn: Lsn::make(0x100, 1),
            nrec: 3,
            checksum: 0xabcd_ef01,
            next_lsn: Lsn::make(0x200, 1),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), BlockHeader::SIZE);
        assert_eq!(&buf[12..16], &0xabcd_ef01u32.to_be_bytes());
        assert_eq!(BlockHeader::decode(&buf), Some(header));
        assert_eq!(header.block_size(), Some(0x100));
    }

    #[test]
    fn test_block_size_rejects_backwards() {
        let header = BlockHeader {
            lsn: Lsn::make(0x200, 1),
            nrec: 1,
            checksum: 0,
            next_lsn: Lsn::make(0x100, 1),
        };
        assert_eq!(header.block_size(), None);
        assert_eq!(BlockHeader::decode(&[0u8; 10]), None);
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let mut block = vec![5u8; 64];
        let sum = block_checksum(&block);
        block[12..16].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(block_checksum(&block), sum);

        block[40] ^= 1;
        assert_ne!(block_checksum(&block), sum);
    }
}
