//! Throughput of the try-acquire fast path under contention: several
//! threads hammering `try_acquire_immediately`/`release` on a semaphore
//! that never needs to queue a waiter.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use segsem::Semaphore;

fn contended_try_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_try_acquire");
    for threads in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let sem = Arc::new(Semaphore::new(threads as u32));
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        let sem = &sem;
                        scope.spawn(move || {
                            for _ in 0..1_000 {
                                if sem.try_acquire_immediately() {
                                    sem.release();
                                }
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, contended_try_acquire);
criterion_main!(benches);
