//! Type definitions for sable.
//!
//! Identifiers and the addressing primitives every other component builds on.

mod ids;
mod ptr;
mod size;

pub use ids::{Fid, Lsn, Oid, Xid};
pub use ptr::{Address, AddressSpace, TaggedPtr};
pub use size::{align_up, SizeCode};
