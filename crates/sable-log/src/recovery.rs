//! Recovery driver types.
//!
//! The log does not know how to rebuild anything; it hands a range of
//! durable log and a [`ScanManager`] to a functor supplied by whoever owns the
//! in-memory state.

use serde::{Deserialize, Serialize};

use sable_common::Lsn;

use crate::error::ReplayError;
use crate::scan::ScanManager;

/// Rebuilds state from a range of the log.
pub trait RecoveryFunctor<C: ?Sized>: Send + Sync {
    /// Replays every transaction committed in `[start, end)` into `ctx`.
    fn replay(&self, ctx: &C, scanner: &ScanManager<'_>, start: Lsn, end: Lsn) -> Result<(), ReplayError>;
}

impl<C, F> RecoveryFunctor<C> for F
where
    C: ?Sized,
    F: Fn(&C, &ScanManager<'_>, Lsn, Lsn) -> Result<(), ReplayError> + Send + Sync,
{
    fn replay(&self, ctx: &C, scanner: &ScanManager<'_>, start: Lsn, end: Lsn) -> Result<(), ReplayError> {
        self(ctx, scanner, start, end)
    }
}

/// Replay functor for shipped log on a backup; it carries its own context.
pub type BackupFunctor = Box<dyn Fn(&ScanManager<'_>, Lsn, Lsn) -> Result<(), ReplayError> + Send + Sync>;

/// How replay work is divided.
///
/// Both policies currently replay sequentially on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayPolicy {
    /// Partition records by OID.
    ByOid,
    /// Partition the log by offset range.
    #[default]
    ByOffset,
}

/// Summary of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Where replay started.
    pub start: Lsn,
    /// Where replay ended (the durable end of the log).
    pub end: Lsn,
    /// Whether a checkpoint supplied the starting state.
    pub from_checkpoint: bool,
}
