//! System-wide constants for sable.
//!
//! Log geometry, block limits and OID array shape. The block layout values
//! are part of the on-disk format and must not change between releases.

// =============================================================================
// Addressing
// =============================================================================

/// Default alignment of log payloads and size classes (16 bytes).
pub const DEFAULT_ALIGNMENT_BITS: u8 = 4;

/// Number of low LSN bits carrying the segment tag.
pub const SEGMENT_TAG_BITS: u32 = 5;

/// Mask selecting the segment tag of an LSN or log pointer.
pub const SEGMENT_TAG_MASK: u64 = (1 << SEGMENT_TAG_BITS) - 1;

/// Largest offset a tagged pointer can carry (48 bits).
pub const MAX_PTR_OFFSET: u64 = (1 << 48) - 1;

// =============================================================================
// Log Segment Constants
// =============================================================================

/// Default log segment size (64 MB).
pub const DEFAULT_LOG_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Minimum log segment size (1 MB).
pub const MIN_LOG_SEGMENT_SIZE: usize = 1024 * 1024;

/// Default size of the in-memory log buffer (32 MB).
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Number of the first segment of a fresh log. It starts at offset zero.
pub const FIRST_SEGMENT_NUMBER: u32 = 1;

// =============================================================================
// Log Block Constants
// =============================================================================

/// Size of a log block header: lsn (8), nrec (4), checksum (4), next_lsn (8).
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Size of one log record slot in a block.
pub const LOG_RECORD_SIZE: usize = 24;

/// Smallest well-formed block: a header and one record.
pub const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + LOG_RECORD_SIZE;

/// Maximum number of records in one block, including a leading chain record.
pub const MAX_BLOCK_RECORDS: usize = 254;

/// Maximum size of one block including payloads (512 KB).
pub const MAX_BLOCK_SIZE: usize = 512 * 1024;

/// Payloads above this size are written out of line and referenced by pointer.
pub const MAX_INLINE_PAYLOAD: usize = MAX_BLOCK_SIZE / 4;

// =============================================================================
// Group Commit Constants
// =============================================================================

/// Committers queued before the flusher is woken early.
pub const GROUP_COMMIT_QUEUE_LENGTH: usize = 3000;

/// Longest a commit waits for its batch to fill, in microseconds.
pub const GROUP_COMMIT_TIMEOUT_US: u64 = 5000;

// =============================================================================
// OID Manager Constants
// =============================================================================

/// File holding per-file metadata, keyed by OID == FID.
pub const METADATA_FID: u32 = 2;

/// First FID handed out to callers.
pub const FIRST_USER_FID: u32 = 3;

/// First OID handed out by an allocator.
pub const FIRST_OID: u32 = 1;

/// log2 of the number of slots in one OID array chunk.
pub const OID_CHUNK_BITS: u32 = 14;

/// Number of slots in one OID array chunk.
pub const OID_CHUNK_SIZE: usize = 1 << OID_CHUNK_BITS;

/// Default per-file OID capacity (16M slots).
pub const DEFAULT_MAX_OIDS_PER_FILE: usize = 1 << 24;

/// Size of the frame in front of every logged object payload:
/// len (4), reserved (4), prev_pdest (8).
pub const OBJECT_FRAME_HEADER_SIZE: usize = 16;

// =============================================================================
// Concurrency Constants
// =============================================================================

/// Busy-spin iterations before a waiter starts yielding the CPU.
pub const SPIN_LIMIT: u32 = 1 << 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_limits_fit() {
        assert!(MIN_BLOCK_SIZE + MAX_INLINE_PAYLOAD < MAX_BLOCK_SIZE);
        assert!(BLOCK_HEADER_SIZE + MAX_BLOCK_RECORDS * LOG_RECORD_SIZE < MAX_BLOCK_SIZE);
        assert!(2 * MAX_BLOCK_SIZE <= MIN_LOG_SEGMENT_SIZE);
        assert!(MIN_LOG_SEGMENT_SIZE as u64 <= MAX_PTR_OFFSET);
    }

    #[test]
    fn test_reserved_fids() {
        assert!(METADATA_FID < FIRST_USER_FID);
        assert_eq!(OID_CHUNK_SIZE, 16384);
    }
}
