//! sable storage core benchmarks
//!
//! This crate contains benchmarks for:
//! - Log staging, commit and group commit
//! - Version chain lookup and pin-on-demand
//! - Transaction commit throughput through the engine
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p sable-bench
//! ```

pub mod utils;
