//! OID manager error types.

use std::io;
use thiserror::Error;

use sable_common::{AddrError, Fid, Lsn, Oid};
use sable_log::LogError;

/// Result type for OID manager operations.
pub type OidResult<T> = Result<T, OidError>;

/// Errors raised by the OID manager, transactions and checkpoints.
#[derive(Debug, Error)]
pub enum OidError {
    /// The log failed underneath an operation.
    #[error(transparent)]
    Log(#[from] LogError),

    /// A pointer or size code could not be decoded.
    #[error(transparent)]
    Addr(#[from] AddrError),

    /// I/O error on a checkpoint file.
    #[error("checkpoint I/O error: {source}")]
    Io {
        /// Underlying error.
        #[from]
        source: io::Error,
    },

    /// No OID array exists for the file.
    #[error("file {0:?} not found")]
    FileNotFound(Fid),

    /// An OID array already exists for the file.
    #[error("file {0:?} already exists")]
    FileExists(Fid),

    /// Every OID of the file is in use.
    #[error("file {0:?} has no free OIDs")]
    FileFull(Fid),

    /// The file was created without an allocator.
    #[error("file {0:?} has no OID allocator")]
    NoAllocator(Fid),

    /// The OID lies outside the array.
    #[error("{oid:?} out of range for file {fid:?}")]
    OidOutOfRange {
        /// File.
        fid: Fid,
        /// Requested OID.
        oid: Oid,
    },

    /// The slot is empty, or its newest version is a tombstone.
    #[error("{oid:?} not found in file {fid:?}")]
    NotFound {
        /// File.
        fid: Fid,
        /// Requested OID.
        oid: Oid,
    },

    /// A new object was put into a slot that is already in use.
    #[error("slot {oid:?} of file {fid:?} is already occupied")]
    SlotOccupied {
        /// File.
        fid: Fid,
        /// Occupied slot.
        oid: Oid,
    },

    /// The slot holds something other than what the operation expects.
    #[error("slot {oid:?} of file {fid:?} holds a {found}, expected a {expected}")]
    WrongEntry {
        /// File.
        fid: Fid,
        /// Slot.
        oid: Oid,
        /// Entry kind the operation needs.
        expected: &'static str,
        /// Entry kind in the slot.
        found: &'static str,
    },

    /// Another transaction wrote the object first.
    #[error("write conflict on {oid:?} in file {fid:?}")]
    Conflict {
        /// File.
        fid: Fid,
        /// Contended OID.
        oid: Oid,
    },

    /// Records cannot be empty; a zero-length stored record means a delete.
    #[error("empty record written to file {fid:?}")]
    EmptyPayload {
        /// File.
        fid: Fid,
    },

    /// The transaction already committed or aborted.
    #[error("transaction is no longer active")]
    TransactionClosed,

    /// The commit was published and is visible, but waiting for it to become
    /// durable failed. It survives a restart only if its block reached disk.
    #[error("transaction committed at {clsn:?} but is not known to be durable: {source}")]
    NotDurable {
        /// Commit LSN of the published transaction.
        clsn: Lsn,
        /// Why the durability wait failed.
        source: LogError,
    },

    /// A checkpoint file failed validation.
    #[error("corrupt checkpoint at {start:?}: {reason}")]
    CorruptCheckpoint {
        /// Start LSN naming the checkpoint.
        start: Lsn,
        /// What failed.
        reason: String,
    },

    /// A stored object frame failed validation.
    #[error("bad object frame: {reason}")]
    BadFrame {
        /// What failed.
        reason: String,
    },

    /// A structure the store depends on is in an impossible state.
    #[error("OID manager invariant violated: {reason}")]
    Invariant {
        /// What was found.
        reason: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    ConfigError {
        /// What is wrong.
        reason: String,
    },
}

impl OidError {
    /// Creates a corrupt checkpoint error.
    pub fn corrupt_checkpoint(start: Lsn, reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            start,
            reason: reason.into(),
        }
    }

    /// Creates a bad frame error.
    pub fn bad_frame(reason: impl Into<String>) -> Self {
        Self::BadFrame {
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

    /// Returns true if this is a write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if the caller may retry, possibly in a new transaction.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::FileFull(_) => true,
            Self::Log(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Returns true if the engine cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Invariant { .. } | Self::CorruptCheckpoint { .. } | Self::Io { .. } => true,
            Self::Log(e) | Self::NotDurable { source: e, .. } => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = OidError::Conflict {
            fid: Fid::new(3),
            oid: Oid::new(7),
        };
        assert!(err.is_conflict());
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());

        let err = OidError::invariant("unknown file in log");
        assert!(err.is_fatal());
        assert!(!err.is_conflict());

        let err = OidError::from(LogError::Failed);
        assert!(err.is_fatal());

        let err = OidError::NotDurable {
            clsn: Lsn::make(128, 1),
            source: LogError::Closed,
        };
        assert!(!err.is_fatal());
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("not known to be durable"));
    }

    #[test]
    fn test_error_display() {
        let err = OidError::WrongEntry {
            fid: Fid::new(3),
            oid: Oid::new(9),
            expected: "directory",
            found: "object",
        };
        let msg = err.to_string();
        assert!(msg.contains("directory"));
        assert!(msg.contains("object"));
    }

    #[test]
    fn test_addr_error_conversion() {
        let err: OidError = AddrError::InvalidSizeCode { code: 0xff }.into();
        assert!(matches!(err, OidError::Addr(_)));
    }
}
