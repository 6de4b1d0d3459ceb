//! # sable-oid
//!
//! In-memory object store for the sable storage core.
//!
//! Every table is a *file*: a chunked array indexed by OID whose slots hold
//! the newest version of a record. Versions form a newest-first chain and are
//! stamped with the commit LSN of the transaction that wrote them, which is
//! all snapshot visibility needs:
//!
//! ```text
//!  slot[oid] ──► v3 (in flight, xid 7) ──► v2 (clsn 0x4a0) ──► v1 (clsn 0x120)
//! ```
//!
//! Versions recovered from the log or a checkpoint start out as bare pointers
//! and are loaded on first use. Old versions are unlinked once no running
//! snapshot can see them and released through epoch-based reclamation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use sable_oid::{Engine, EngineConfig};
//!
//! # fn main() -> sable_oid::OidResult<()> {
//! let engine = Engine::open(EngineConfig::new("/tmp/sable"))?;
//! let users = engine.create_table("users")?;
//!
//! let mut txn = engine.begin()?;
//! let oid = txn.insert(users, Bytes::from_static(b"alice"))?;
//! txn.commit()?;
//!
//! assert_eq!(engine.read_latest(users, oid)?.as_deref(), Some(&b"alice"[..]));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// Versions, their commit stamps and stored frames.
pub mod object;

/// Chunked OID arrays.
pub mod array;

/// Per-file OID allocation.
pub mod alloc;

/// Epoch-based reclamation.
pub mod gc;

/// Snapshot visibility.
pub mod snapshot;

/// Files, slots and version chains.
pub mod manager;

/// Rebuilding OID arrays from the log.
pub mod replay;

/// Checkpoint data files.
pub mod checkpoint;

/// Engine counters.
pub mod stats;

/// Transactions.
pub mod txn;

/// The storage engine.
pub mod engine;

pub use config::EngineConfig;
pub use error::{OidError, OidResult};
pub use array::{Head, OidArray, OidDir};
pub use alloc::OidAllocator;
pub use checkpoint::{CheckpointFile, CheckpointSummary};
pub use engine::{Engine, Storage};
pub use gc::{EpochConfig, EpochManager, GarbageCollector, GcConfig, GcResult};
pub use manager::{OidFile, OidManager};
pub use object::{Object, ObjectFrame, ObjectStatus, PayloadSource, Stamp};
pub use replay::{OidReplay, ReplayStats};
pub use snapshot::Snapshot;
pub use stats::EngineStatsSnapshot;
pub use txn::{Transaction, TransactionState};
