use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use merkle_kv::entry::Entry;
use merkle_kv::store::{MemoryEngine, StoreEngine};
use std::time::Duration;

fn bench_put_get(c: &mut Criterion) {
    let engine = MemoryEngine::new();
    for i in 0..100_000 {
        let entry = Entry::new_value(format!("v{i}"), i as u64, "n1".into(), i as u64).unwrap();
        engine.put(&format!("user:{i:06}"), entry).unwrap();
    }

    let mut g = c.benchmark_group("storage");
    g.sample_size(60)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(2))
        .sampling_mode(SamplingMode::Auto);

    g.bench_function(BenchmarkId::new("get", 100_000), |b| {
        b.iter(|| {
            let key = black_box("user:012345");
            black_box(engine.get(key));
        });
    });

    g.bench_function(BenchmarkId::new("put_new_entry", 100_000), |b| {
        let mut i = 100_000u64;
        b.iter(|| {
            let entry = Entry::new_value("x".into(), i, "n1".into(), i).unwrap();
            engine.put(black_box(&format!("bench:{i}")), entry).unwrap();
            i += 1;
        });
    });

    g.finish();
}

criterion_group!(benches, bench_put_get);
criterion_main!(benches);
