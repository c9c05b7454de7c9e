//! Criterion benchmarks for the connection table and the frame codec.
//!
//! The table is scanned linearly on every insert, so the interesting number
//! is how insert cost grows as the table fills.
//!
//! Run with:
//! ```bash
//! cargo bench --package fdmux-core --bench table_bench
//! ```

use std::os::fd::{AsRawFd, RawFd};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fdmux_core::{decode_frame, encode_frame, ConnectionTable, PeerAddress, SlotId};

struct BenchHandle(RawFd);

impl AsRawFd for BenchHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

fn bench_fill_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_fill_and_drain");
    for capacity in [20usize, 256, 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let mut table = ConnectionTable::new(capacity, 1024);
                    for fd in 0..capacity {
                        let _ = table.insert(BenchHandle(fd as RawFd), PeerAddress::Local(None));
                    }
                    for index in 0..capacity {
                        black_box(table.remove(SlotId::new(index)));
                    }
                })
            },
        );
    }
    group.finish();
}

fn bench_reuse_last_slot(c: &mut Criterion) {
    let capacity = 1024;
    let mut table = ConnectionTable::new(capacity, 1024);
    for fd in 0..capacity {
        let _ = table.insert(BenchHandle(fd as RawFd), PeerAddress::Local(None));
    }
    let last = SlotId::new(capacity - 1);

    c.bench_function("table_reuse_last_slot", |b| {
        b.iter(|| {
            table.remove(last);
            black_box(table.insert(BenchHandle(9999), PeerAddress::Local(None)).ok());
        })
    });
}

// ── Frame codec ───────────────────────────────────────────────────────────────

fn bench_frame_codec(c: &mut Criterion) {
    let payload = vec![0x5Au8; 1024];
    let frame = encode_frame(&payload).unwrap_or_default();

    c.bench_function("frame_encode_1k", |b| {
        b.iter(|| black_box(encode_frame(black_box(&payload)).ok()))
    });
    c.bench_function("frame_decode_1k", |b| {
        b.iter(|| black_box(decode_frame(black_box(&frame)).ok()))
    });
}

criterion_group!(
    benches,
    bench_fill_and_drain,
    bench_reuse_last_slot,
    bench_frame_codec
);
criterion_main!(benches);
