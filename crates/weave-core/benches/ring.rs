//! Ring and run-queue benchmarks
//!
//! - Uncontended enqueue/dequeue pairs on the call ring
//! - Two producers feeding one consumer
//! - Run-queue put/get across spread priorities

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

use weave_core::{Priority, Ring, RunQueue};

type Frame = [usize; 7];

fn bench_ring_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_single_thread");
    group.throughput(Throughput::Elements(1));
    for cap in [64usize, 1024] {
        let ring: Ring<Frame> = Ring::with_capacity(cap);
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue", cap), &cap, |b, _| {
            b.iter(|| {
                ring.try_enqueue(black_box([1; 7])).ok();
                black_box(ring.try_dequeue());
            })
        });
    }
    group.finish();
}

fn bench_ring_mpsc(c: &mut Criterion) {
    const BATCH: usize = 10_000;
    let mut group = c.benchmark_group("ring_mpsc");
    group.throughput(Throughput::Elements(BATCH as u64 * 2));
    group.bench_function("two_producers", |b| {
        b.iter(|| {
            let ring: Arc<Ring<Frame>> = Arc::new(Ring::with_capacity(1024));
            let producers: Vec<_> = (0..2)
                .map(|_| {
                    let ring = Arc::clone(&ring);
                    thread::spawn(move || {
                        for i in 0..BATCH {
                            let mut frame = [i; 7];
                            while let Err(back) = ring.try_enqueue(frame) {
                                frame = back;
                                std::hint::spin_loop();
                            }
                        }
                    })
                })
                .collect();
            let mut got = 0;
            while got < BATCH * 2 {
                if ring.try_dequeue().is_some() {
                    got += 1;
                }
            }
            for p in producers {
                p.join().unwrap();
            }
        })
    });
    group.finish();
}

fn bench_runq(c: &mut Criterion) {
    let mut group = c.benchmark_group("runq");
    group.throughput(Throughput::Elements(32));
    group.bench_function("put_get_32", |b| {
        let mut rq = RunQueue::new();
        b.iter(|| {
            for i in 0..32u8 {
                rq.put(Priority::new((i * 7) % 32), i);
            }
            while let Some(item) = rq.get() {
                black_box(item);
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_ring_single, bench_ring_mpsc, bench_runq);
criterion_main!(benches);
