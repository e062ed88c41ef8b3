use std::hint::black_box;
use std::sync::Arc;

use criterion::{Bencher, Criterion, criterion_group, criterion_main};
use segjournal::{Journal, JournalOptions, MemoryMetastore, SyncMode};
use tempfile::TempDir;

// Helper to create a journal in a temporary directory for isolated benchmark runs.
fn setup_journal(sync_mode: SyncMode) -> (Journal, TempDir) {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = JournalOptions::new(dir.path());
  opts.sync_mode = sync_mode;
  let journal = Journal::open(opts, Arc::new(MemoryMetastore::new())).unwrap();
  (journal, dir)
}

fn bench_appends(c: &mut Criterion) {
  let mut group = c.benchmark_group("Append Operations");
  let payload = vec![0u8; 256]; // A realistic 256-byte payload

  // --- Single Append Benchmarks ---

  group.bench_function("append_single_strict", |b: &mut Bencher| {
    b.iter_batched(
      || setup_journal(SyncMode::Strict),
      |(journal, _dir)| {
        journal.append_data(black_box(&payload)).unwrap();
      },
      criterion::BatchSize::SmallInput,
    )
  });

  group.bench_function("append_single_explicit", |b: &mut Bencher| {
    b.iter_batched(
      || setup_journal(SyncMode::Explicit),
      |(journal, _dir)| {
        journal.append_data(black_box(&payload)).unwrap();
      },
      criterion::BatchSize::SmallInput,
    )
  });

  // --- Group Commit Benchmarks ---
  // 100 appends made durable by one flush.

  group.bench_function("append_100_then_flush", |b: &mut Bencher| {
    b.iter_batched(
      || setup_journal(SyncMode::Explicit),
      |(journal, _dir)| {
        for asqn in 1..=100 {
          journal.append(asqn, black_box(&payload)).unwrap();
        }
        journal.flush().unwrap();
      },
      criterion::BatchSize::SmallInput,
    )
  });

  // --- Rollover ---
  // Small segments force a new file every 16 records.

  group.bench_function("append_100_with_rollover", |b: &mut Bencher| {
    b.iter_batched(
      || {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = JournalOptions::new(dir.path());
        opts.max_segment_size = 64 + 16 * (32 + 256);
        let journal = Journal::open(opts, Arc::new(MemoryMetastore::new())).unwrap();
        (journal, dir)
      },
      |(journal, _dir)| {
        for _ in 0..100 {
          journal.append_data(black_box(&payload)).unwrap();
        }
      },
      criterion::BatchSize::SmallInput,
    )
  });

  group.finish();
}

criterion_group!(benches, bench_appends);
criterion_main!(benches);
