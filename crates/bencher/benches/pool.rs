use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use micro_mux::connection::ConnId;
use micro_mux::pool::{Acquire, HeaderPool};

fn benchmark_lease_cycle(criterion: &mut Criterion) {
    let pool = HeaderPool::new(32, 8 * 1024);
    let mut next = 0u64;

    criterion.bench_function("header_pool_lease_release", |b| {
        b.iter(|| {
            next += 1;
            match pool.acquire(ConnId::new(next)) {
                Acquire::Leased(lease) => drop(black_box(lease)),
                Acquire::Pending(_) => unreachable!("nothing else holds a slot"),
            }
        });
    });
}

criterion_group!(pool, benchmark_lease_cycle);
criterion_main!(pool);
