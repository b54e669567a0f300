use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use keystone_context::TokenMinter;

fn bench_session_churn(c: &mut Criterion) {
    let mut minter = TokenMinter::new().expect("clock unusable");

    let mut group = c.benchmark_group("tokens");
    group.throughput(Throughput::Elements(1));

    group.bench_function("mint_retire", |b| {
        b.iter(|| {
            let token = minter.mint().unwrap();
            black_box(minter.retire(token))
        });
    });

    // Live set grows without bound here; sized by criterion's sample count.
    group.bench_function("mint_growing_live_set", |b| {
        b.iter(|| black_box(minter.mint().unwrap()));
    });

    drop(group);
}

criterion_group!(benches, bench_session_churn);
criterion_main!(benches);
