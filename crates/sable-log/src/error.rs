//! Log error types.
//!
//! This module defines all error types for the log manager and its scanners.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use sable_common::{AddrError, Lsn};

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Error returned by a recovery functor.
pub type ReplayError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error during log operations.
    #[error("log I/O error: {source}")]
    Io {
        /// Underlying error.
        #[from]
        source: io::Error,
    },

    /// A segment write completed only partially. The log refuses further writes.
    #[error("short write to segment {segnum}: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// Segment written to.
        segnum: u32,
        /// Bytes the device accepted.
        written: usize,
        /// Bytes requested.
        expected: usize,
    },

    /// A read of data the log promised was durable came back short.
    #[error("short read at {lsn:?}: got {got} of {expected} bytes")]
    ShortRead {
        /// Where the read started.
        lsn: Lsn,
        /// Bytes returned.
        got: usize,
        /// Bytes requested.
        expected: usize,
    },

    /// A pointer or size code could not be decoded.
    #[error(transparent)]
    Addr(#[from] AddrError),

    /// Block at `lsn` failed validation where a valid block was required.
    #[error("corrupt log block at {lsn:?}: {reason}")]
    CorruptBlock {
        /// Block position.
        lsn: Lsn,
        /// What failed.
        reason: String,
    },

    /// No segment covers the given LSN.
    #[error("no log segment covers {lsn:?}")]
    SegmentNotFound {
        /// The uncovered position.
        lsn: Lsn,
    },

    /// A file in the log directory has a name the log cannot parse.
    #[error("malformed log file name: {path}")]
    BadFileName {
        /// The offending file.
        path: PathBuf,
    },

    /// A single block would exceed the maximum block size.
    #[error("log block too large: {size} bytes exceeds maximum {max} bytes")]
    BlockTooLarge {
        /// Size the block would need.
        size: usize,
        /// Largest allowed block.
        max: usize,
    },

    /// Shipped bytes do not continue the local log.
    #[error("shipped log range starts at {start:?}, local log ends at {expected:?}")]
    NotContiguous {
        /// Where the shipped range starts.
        start: Lsn,
        /// Where the local log ends.
        expected: Lsn,
    },

    /// A recovery functor failed.
    #[error("replay of [{start:?}, {end:?}) failed: {source}")]
    ReplayFailed {
        /// Start of the replayed range.
        start: Lsn,
        /// End of the replayed range.
        end: Lsn,
        /// The functor's error.
        #[source]
        source: ReplayError,
    },

    /// No backup functor was registered before a backup replay.
    #[error("no backup replay functor registered")]
    NoBackupFunctor,

    /// A structure the log depends on is missing or in an impossible state.
    #[error("log invariant violated: {reason}")]
    Invariant {
        /// What was found.
        reason: String,
    },

    /// An earlier fatal error disabled the log.
    #[error("log is unavailable after a fatal error")]
    Failed,

    /// Log is closed.
    #[error("log is closed")]
    Closed,

    /// Configuration error.
    #[error("log configuration error: {reason}")]
    ConfigError {
        /// What is wrong.
        reason: String,
    },
}

impl LogError {
    /// Creates a corrupt block error.
    pub fn corrupt_block(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::CorruptBlock {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates an invariant violation.
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::Invariant {
            reason: reason.into(),
        }
    }

    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Creates a replay failure.
    pub fn replay_failed(start: Lsn, end: Lsn, source: ReplayError) -> Self {
        Self::ReplayFailed { start, end, source }
    }

    /// Returns true if the caller may retry with corrected input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Addr(_) | Self::BlockTooLarge { .. } | Self::NotContiguous { .. }
        )
    }

    /// Returns true if the log cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ShortWrite { .. }
                | Self::ShortRead { .. }
                | Self::Invariant { .. }
                | Self::ReplayFailed { .. }
                | Self::Failed
                | Self::Io { .. }
        )
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptBlock { .. } | Self::ShortRead { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LogError::corrupt_block(Lsn::make(48, 1), "bad checksum");
        assert!(err.is_corruption());
        assert!(!err.is_fatal());

        let err = LogError::ShortWrite {
            segnum: 1,
            written: 10,
            expected: 48,
        };
        assert!(err.is_fatal());
        assert!(!err.is_corruption());

        let err = LogError::invariant("segment missing");
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());

        let err = LogError::from(AddrError::InvalidSizeCode { code: 0xff });
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = LogError::BlockTooLarge {
            size: 1_000_000,
            max: 524_288,
        };
        let msg = err.to_string();
        assert!(msg.contains("1000000"));
        assert!(msg.contains("524288"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: LogError = io_err.into();
        assert!(matches!(err, LogError::Io { .. }));
    }

    #[test]
    fn test_replay_failure_keeps_source() {
        let source: ReplayError = "bad record".into();
        let err = LogError::replay_failed(Lsn::make(0, 1), Lsn::make(96, 1), source);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("bad record"));
    }
}
