//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use sable_common::constants::{DEFAULT_ALIGNMENT_BITS, DEFAULT_MAX_OIDS_PER_FILE, FIRST_OID};
use sable_log::LogConfig;

use crate::gc::{EpochConfig, GcConfig};

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Log configuration. Checkpoints are written to the log directory.
    pub log: LogConfig,

    /// Capacity of each file's OID array.
    pub max_oids_per_file: usize,

    /// Alignment new versions are logged with.
    pub align_bits: u8,

    /// Whether `commit` waits for the commit to become durable.
    pub sync_commit: bool,

    /// Whether `close` writes a checkpoint first.
    pub checkpoint_on_close: bool,

    /// Epoch manager tuning.
    pub epoch: EpochConfig,

    /// Garbage collector tuning.
    pub gc: GcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            max_oids_per_file: DEFAULT_MAX_OIDS_PER_FILE,
            align_bits: DEFAULT_ALIGNMENT_BITS,
            sync_commit: true,
            checkpoint_on_close: false,
            epoch: EpochConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            log: LogConfig::new(dir),
            ..Default::default()
        }
    }

    /// Small log geometry and OID arrays.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            log: LogConfig::for_testing(dir),
            max_oids_per_file: 1 << 16,
            ..Default::default()
        }
    }

    /// Sets the log configuration.
    #[must_use]
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Sets the OID array capacity.
    #[must_use]
    pub fn with_max_oids_per_file(mut self, max: usize) -> Self {
        self.max_oids_per_file = max;
        self
    }

    /// Sets the alignment new versions are logged with.
    #[must_use]
    pub fn with_align_bits(mut self, bits: u8) -> Self {
        self.align_bits = bits;
        self
    }

    /// Sets whether commits wait for durability.
    #[must_use]
    pub fn with_sync_commit(mut self, sync: bool) -> Self {
        self.sync_commit = sync;
        self
    }

    /// Sets whether `close` checkpoints first.
    #[must_use]
    pub fn with_checkpoint_on_close(mut self, enabled: bool) -> Self {
        self.checkpoint_on_close = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.log.validate()?;

        if self.max_oids_per_file <= FIRST_OID as usize {
            return Err("OID arrays must hold at least one usable OID".to_string());
        }

        if self.max_oids_per_file > u32::MAX as usize {
            return Err("OID array capacity must fit in 32 bits".to_string());
        }

        if self.align_bits > 12 {
            return Err("Alignment must be at most 4 KiB".to_string());
        }

        if self.gc.max_versions_per_run == 0 {
            return Err("GC must be allowed to collect at least one version per run".to_string());
        }

        Ok(())
    }
}
