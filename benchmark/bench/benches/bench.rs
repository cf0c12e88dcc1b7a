use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use jitgemm_x86::{generate, ArchTier, BatchReduce, CallConv, Datatype, GemmDescriptor};

const TIERS: [ArchTier; 4] = [ArchTier::Sse42, ArchTier::Avx2, ArchTier::Avx512Vl256, ArchTier::Avx512Core];

fn desc(dim: usize, dt: Datatype) -> GemmDescriptor {
    GemmDescriptor::builder(dim, dim, dim, dt).call_conv(CallConv::SysV).build().unwrap()
}

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate");
    for dt in [Datatype::F32, Datatype::F64] {
        for dim in [8, 23, 64] {
            let d = desc(dim, dt);
            for arch in TIERS {
                let id = BenchmarkId::new(format!("{}-{}", arch, dt), dim);
                group.bench_with_input(id, &d, |bench_b, d| bench_b.iter(|| generate(d, arch).unwrap()));
            }
        }
    }
    group.finish();
}

fn bench_variants(c: &mut Criterion) {
    let mut group = c.benchmark_group("variants");
    let arch = ArchTier::Avx512Core;
    let base = |dt| GemmDescriptor::builder(32, 32, 32, dt).call_conv(CallConv::SysV);
    let cases = [
        ("trans-a", base(Datatype::F32).trans_a(true).build().unwrap()),
        ("address", base(Datatype::F32).batch_reduce(BatchReduce::Address).build().unwrap()),
        ("bf16", base(Datatype::Bf16).build().unwrap()),
        ("i8", base(Datatype::I8).output(Datatype::I32).build().unwrap()),
    ];
    for (name, d) in cases.iter() {
        group.bench_with_input(BenchmarkId::new(*name, 32), d, |bench_b, d| bench_b.iter(|| generate(d, arch).unwrap()));
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(10);
    targets = bench_generation, bench_variants
);
criterion_main!(benches);
