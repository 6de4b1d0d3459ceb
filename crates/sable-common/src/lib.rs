//! # sable-common
//!
//! Foundational types shared by every sable crate.
//!
//! - **Identifiers**: `Lsn`, `Fid`, `Oid`, `Xid`
//! - **Addressing**: `TaggedPtr`, the single addressing currency shared by
//!   the object store, the log and checkpoints, and the `SizeCode` codec
//! - **Constants**: log geometry, block limits, OID array shape
//! - **Errors**: `AddrError` for addressing misuse
//!
//! ## Example
//!
//! ```rust
//! use sable_common::types::{AddressSpace, Lsn, SizeCode, TaggedPtr};
//!
//! let lsn = Lsn::make(4096, 1);
//! let ptr = TaggedPtr::log(lsn, SizeCode::encode(100, 4));
//! assert_eq!(ptr.space(), Some(AddressSpace::Log));
//! assert_eq!(ptr.as_lsn().unwrap(), lsn);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::{AddrError, AddrResult};
pub use types::{Address, AddressSpace, Fid, Lsn, Oid, SizeCode, TaggedPtr, Xid};
