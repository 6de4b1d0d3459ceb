//! Log configuration.
//!
//! This module provides configuration options for the log manager.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::recovery::ReplayPolicy;

use sable_common::constants::{
    DEFAULT_LOG_BUFFER_SIZE, DEFAULT_LOG_SEGMENT_SIZE, GROUP_COMMIT_QUEUE_LENGTH,
    GROUP_COMMIT_TIMEOUT_US, MAX_BLOCK_SIZE, MAX_PTR_OFFSET, MIN_LOG_SEGMENT_SIZE,
};

/// Sync policy for log flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// fsync after every flush; committers are batched by group commit.
    #[default]
    GroupCommit,
    /// Each committer flushes and syncs on its own, without batching.
    EveryCommit,
    /// Write but never fsync (fastest, unsafe - for testing only).
    Never,
}

/// Group commit tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCommitConfig {
    /// Whether a background flusher batches commits.
    pub enabled: bool,
    /// Number of queued committers that wakes the flusher early.
    pub queue_length: usize,
    /// Longest a batch waits to fill before it is flushed.
    pub timeout: Duration,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_length: GROUP_COMMIT_QUEUE_LENGTH,
            timeout: Duration::from_micros(GROUP_COMMIT_TIMEOUT_US),
        }
    }
}

/// Configuration for the log manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding segments, the durable mark and checkpoint files.
    pub dir: PathBuf,

    /// Size of each segment file in bytes.
    pub segment_size: usize,

    /// Size of the circular in-memory log buffer.
    pub buffer_size: usize,

    /// Sync policy for durability.
    pub sync_policy: SyncPolicy,

    /// Group commit tuning.
    pub group_commit: GroupCommitConfig,

    /// Remove every file in `dir` at open, starting a fresh log.
    pub null_log_device: bool,

    /// Whether record scans verify block checksums.
    pub verify_checksums: bool,

    /// How recovery divides replay work.
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/log"),
            segment_size: DEFAULT_LOG_SEGMENT_SIZE,
            buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            sync_policy: SyncPolicy::default(),
            group_commit: GroupCommitConfig::default(),
            null_log_device: false,
            verify_checksums: true,
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl LogConfig {
    /// Creates a new log configuration with the specified directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Small segments and buffers, short group-commit timeout.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir)
            .with_segment_size(MIN_LOG_SEGMENT_SIZE)
            .with_buffer_size(4 * MAX_BLOCK_SIZE)
            .with_group_commit(GroupCommitConfig {
                enabled: true,
                queue_length: 8,
                timeout: Duration::from_millis(1),
            })
    }

    /// Sets the segment size.
    #[must_use]
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the log buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the sync policy.
    #[must_use]
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Sets the group commit tuning.
    #[must_use]
    pub fn with_group_commit(mut self, group_commit: GroupCommitConfig) -> Self {
        self.group_commit = group_commit;
        self
    }

    /// Sets whether the directory is wiped at open.
    #[must_use]
    pub fn with_null_log_device(mut self, wipe: bool) -> Self {
        self.null_log_device = wipe;
        self
    }

    /// Sets whether record scans verify checksums.
    #[must_use]
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Sets the replay policy.
    #[must_use]
    pub fn with_replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay_policy = policy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size < MIN_LOG_SEGMENT_SIZE {
            return Err("Segment size must be at least 1 MB".to_string());
        }

        if self.segment_size as u64 > MAX_PTR_OFFSET {
            return Err("Segment size does not fit in a log pointer".to_string());
        }

        if self.buffer_size < 2 * MAX_BLOCK_SIZE {
            return Err("Log buffer must hold at least two maximum-size blocks".to_string());
        }

        if self.group_commit.queue_length == 0 {
            return Err("Group commit queue length must be positive".to_string());
        }

        Ok(())
    }

    /// Returns the directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
