//! # sable-log
//!
//! Write-ahead log for the sable storage core.
//!
//! This crate implements a segmented, block-structured redo log with:
//! - Lock-light space allocation through a circular log buffer
//! - Per-transaction staging with overflow chains for large transactions
//! - Group commit
//! - Scanners and a functor-driven recovery entry point
//! - Log shipping to a backup
//!
//! # Architecture
//!
//! The log is a single logical byte stream split into segment files. An LSN
//! packs a byte offset with a 5-bit segment tag, so stale LSNs from a reused
//! tag are caught on read. Everything is written in blocks:
//!
//! ```text
//! +---------+----------+--------------+-------------+
//! | LSN (8) | nrec (4) | checksum (4) | next LSN (8) |
//! +---------+----------+--------------+-------------+
//! |        nrec x 24-byte record entries           |
//! +-------------------------------------------------+
//! |        payloads, each padded to its size code  |
//! +-------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// Block and record formats.
pub mod block;

/// Log segment files.
pub mod segment;

/// Durable and checkpoint marker files.
pub mod marks;

/// Circular log buffer.
pub mod buffer;

/// Log space allocation and flushing.
pub mod alloc;

/// Log counters.
pub mod stats;

/// Group commit implementation.
pub mod group_commit;

/// Per-transaction staging.
pub mod staging;

/// Block, record and transaction scanners.
pub mod scan;

/// Recovery functors and reports.
pub mod recovery;

/// Main log manager.
pub mod log;

pub use config::{GroupCommitConfig, LogConfig, SyncPolicy};
pub use error::{LogError, LogResult, ReplayError};
pub use block::{LogRecord, RecordKind, RecordSpec, RecordType};
pub use log::Log;
pub use marks::CheckpointMark;
pub use recovery::{BackupFunctor, RecoveryFunctor, RecoveryReport, ReplayPolicy};
pub use scan::{HeaderScan, LogScanner, RecordScan, ScanManager};
pub use staging::{CommitRecord, RequestId, TxLog};
pub use stats::LogStatsSnapshot;
