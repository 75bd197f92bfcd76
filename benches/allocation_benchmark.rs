use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal_macros::dec;
use settlement_core::allocation::largest_remainder::allocate_pro_rata;
use settlement_core::allocation::split::RevenueSplit;
use settlement_core::simulation::holdings::{generate_holdings, HoldingsConfig};

fn bench_allocation(c: &mut Criterion, holder_count: usize) {
    let config = HoldingsConfig {
        holder_count,
        ..Default::default()
    };
    let claims = generate_holdings(&config);

    c.bench_function(&format!("allocate_{}_holders", holder_count), |b| {
        b.iter(|| allocate_pro_rata(black_box(dec!(1000000.01)), black_box(&claims), 2))
    });
}

fn bench_allocation_10_holders(c: &mut Criterion) {
    bench_allocation(c, 10);
}

fn bench_allocation_100_holders(c: &mut Criterion) {
    bench_allocation(c, 100);
}

fn bench_allocation_1000_holders(c: &mut Criterion) {
    bench_allocation(c, 1000);
}

fn bench_allocation_10000_holders(c: &mut Criterion) {
    bench_allocation(c, 10_000);
}

fn bench_revenue_split(c: &mut Criterion) {
    let split = RevenueSplit::default();

    c.bench_function("revenue_split", |b| {
        b.iter(|| split.apply(black_box(dec!(12500.01)), 2))
    });
}

criterion_group!(
    benches,
    bench_allocation_10_holders,
    bench_allocation_100_holders,
    bench_allocation_1000_holders,
    bench_allocation_10000_holders,
    bench_revenue_split
);
criterion_main!(benches);
