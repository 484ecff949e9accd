//! Benchmark: word-at-a-time zero-byte scan vs plain byte scan.
//!
//! The allocator's free-counter search reads eight packed counters per step
//! and applies the subtract-and-mask zero-byte test; this compares it
//! against the naive per-byte loop over a realistic counter array.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dvol_slab::refcounts::find_free_counter;

const COUNTERS: usize = 16384;
const PADDING: usize = 16;

/// Build a mostly-full counter array: ~2% free, scattered.
fn make_counters() -> Vec<u8> {
    let mut counters = vec![1_u8; COUNTERS + PADDING];
    let mut pos = 97_usize;
    while pos < COUNTERS {
        counters[pos] = 0;
        pos += 53;
    }
    // Padding past the live range stays zero.
    for byte in counters.iter_mut().skip(COUNTERS) {
        *byte = 0;
    }
    counters
}

fn naive_find(counters: &[u8], start: u32, end: u32) -> Option<u32> {
    (start..end).find(|index| counters[*index as usize] == 0)
}

fn bench_scan_from_start(c: &mut Criterion) {
    let counters = make_counters();
    let mut group = c.benchmark_group("find_free_from_start");

    group.bench_function("naive_bytes", |b| {
        b.iter(|| black_box(naive_find(black_box(&counters), 0, COUNTERS as u32)));
    });
    group.bench_function("word_scan", |b| {
        b.iter(|| black_box(find_free_counter(black_box(&counters), 0, COUNTERS as u32)));
    });
    group.finish();
}

fn bench_scan_long_run(c: &mut Criterion) {
    // Worst case: a single hole at the very end of the array.
    let mut counters = vec![1_u8; COUNTERS + PADDING];
    counters[COUNTERS - 1] = 0;
    for byte in counters.iter_mut().skip(COUNTERS) {
        *byte = 0;
    }

    let mut group = c.benchmark_group("find_free_long_run");
    group.bench_function("naive_bytes", |b| {
        b.iter(|| black_box(naive_find(black_box(&counters), 0, COUNTERS as u32)));
    });
    group.bench_function("word_scan", |b| {
        b.iter(|| black_box(find_free_counter(black_box(&counters), 0, COUNTERS as u32)));
    });
    group.finish();
}

criterion_group!(benches, bench_scan_from_start, bench_scan_long_run);
criterion_main!(benches);
