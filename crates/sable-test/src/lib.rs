//! # sable-test
//!
//! Integration tests for the sable storage core.
//!
//! This crate contains:
//! - Crash and recovery scenarios
//! - Snapshot visibility and conflict checks under concurrency
//! - Log truncation, spilling and shipping through the engine
//! - Helpers for opening, crashing and inspecting test databases

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test utilities and helpers
pub mod utils;

/// Workload generators
pub mod workload;
