//! Benchmark utilities and helpers.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use sable_log::{GroupCommitConfig, LogConfig, SyncPolicy};
use sable_oid::EngineConfig;

/// Generates `count` payloads of `size` random bytes.
pub fn generate_payloads(count: usize, size: usize) -> Vec<Bytes> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| {
            let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
            Bytes::from(data)
        })
        .collect()
}

/// Generates `count` random indexes below `bound`.
pub fn generate_indexes(count: usize, bound: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count).map(|_| rng.gen_range(0..bound)).collect()
}

/// A log configuration that never waits on the disk.
pub fn bench_log_config(dir: &TempDir) -> LogConfig {
    LogConfig::new(dir.path())
        .with_sync_policy(SyncPolicy::Never)
        .with_group_commit(GroupCommitConfig {
            enabled: false,
            ..GroupCommitConfig::default()
        })
}

/// An engine configuration on top of [`bench_log_config`].
pub fn bench_engine_config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path())
        .with_log(bench_log_config(dir))
        .with_sync_commit(false)
}
