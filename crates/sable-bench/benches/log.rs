//! Log benchmarks for the sable storage core.
//!
//! Benchmarks for:
//! - Staging and committing small transactions
//! - Commit latency with group commit and synchronous flushes
//! - Header scans over a populated log

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sable_bench::utils::{bench_log_config, generate_payloads};
use sable_common::constants::DEFAULT_ALIGNMENT_BITS;
use sable_common::{Fid, Oid};
use sable_log::{GroupCommitConfig, Log, SyncPolicy};
use tempfile::TempDir;

/// Benchmark staging and committing transactions of various widths.
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("log/commit");

    for records in [1usize, 8, 64].iter() {
        let payloads = generate_payloads(*records, 100);
        let dir = TempDir::new().unwrap();
        let log = Log::open(bench_log_config(&dir)).unwrap();

        group.throughput(Throughput::Elements(*records as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), records, |b, _| {
            b.iter(|| {
                let mut tx = log.new_tx_log();
                for (i, payload) in payloads.iter().enumerate() {
                    tx.log_insert(Fid::new(3), Oid::new(i as u32 + 1), payload.clone(), DEFAULT_ALIGNMENT_BITS)
                        .unwrap();
                }
                black_box(tx.commit().unwrap())
            });
        });
        log.close().unwrap();
    }

    group.finish();
}

/// Benchmark durable commits: one sync per commit versus batched group commit.
fn bench_durable_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("log/durable_commit");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    let payload = generate_payloads(1, 100).remove(0);
    let policies = [
        ("every_commit", SyncPolicy::EveryCommit, false),
        ("group_commit", SyncPolicy::GroupCommit, true),
    ];
    for (name, policy, batched) in policies {
        let dir = TempDir::new().unwrap();
        let config = bench_log_config(&dir)
            .with_sync_policy(policy)
            .with_group_commit(GroupCommitConfig {
                enabled: batched,
                queue_length: 64,
                timeout: Duration::from_millis(1),
            });
        let log = Log::open(config).unwrap();

        group.bench_function(name, |b| {
            b.iter(|| {
                let mut tx = log.new_tx_log();
                tx.log_insert(Fid::new(3), Oid::new(1), payload.clone(), DEFAULT_ALIGNMENT_BITS)
                    .unwrap();
                let rec = tx.commit().unwrap();
                log.wait_for_durable(rec.commit_lsn).unwrap();
            });
        });
        log.close().unwrap();
    }

    group.finish();
}

/// Benchmark header scans over a log of small transactions.
fn bench_header_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("log/header_scan");

    for txns in [1000usize, 10_000].iter() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(bench_log_config(&dir)).unwrap();
        let payloads = generate_payloads(4, 100);
        for t in 0..*txns {
            let mut tx = log.new_tx_log();
            for (i, payload) in payloads.iter().enumerate() {
                let oid = Oid::new((t * payloads.len() + i) as u32 + 1);
                tx.log_insert(Fid::new(3), oid, payload.clone(), DEFAULT_ALIGNMENT_BITS)
                    .unwrap();
            }
            tx.commit().unwrap();
        }
        log.flush().unwrap();

        group.throughput(Throughput::Elements((*txns * payloads.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(txns), txns, |b, _| {
            b.iter(|| {
                let scans = log.scan_manager();
                let mut scan = scans.new_header_scan(log.first_lsn());
                let mut count = 0usize;
                while scan.valid() {
                    count += 1;
                    scan.next();
                }
                black_box(count)
            });
        });
        log.close().unwrap();
    }

    group.finish();
}

criterion_group!(benches, bench_commit, bench_durable_commit, bench_header_scan);
criterion_main!(benches);
