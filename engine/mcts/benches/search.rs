//! Search and cache throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use engine_config::CentralConfig;
use engine_core::{ChessPosition, NullTablebase, TimeControl};
use mcts::cache::CacheProbe;
use mcts::{PredictionCache, SearchController, UniformEvaluator};

fn bench_config() -> CentralConfig {
    let mut config = CentralConfig::default();
    config.cache.request_gib = 0;
    config.cache.min_gib = 0;
    config.workers.thread_count = 1;
    config.workers.parallelism = 8;
    config.workers.slowstart_nodes = 0;
    config
}

fn bench_search(c: &mut Criterion) {
    let mut controller = SearchController::with_seed(
        bench_config(),
        Box::new(UniformEvaluator::new()),
        Box::new(NullTablebase),
        Some(7),
    )
    .expect("controller");
    let fen = ChessPosition::new().fen();

    c.bench_function("search_256_simulations", |b| {
        b.iter(|| {
            controller.update_position(&fen, &[], true).unwrap();
            controller.go(&TimeControl::nodes(256));
            controller.wait_until_ready();
            black_box(controller.last_best_move());
        })
    });
}

fn bench_cache_probe(c: &mut Criterion) {
    let mut cache = PredictionCache::new();
    cache.allocate(1, 1).expect("allocate");
    let priors = [0.05f32; 20];
    let mut out = [0f32; 56];

    // Pre-populate a working set.
    for key in 1..=4096u64 {
        if let CacheProbe::Miss { store: Some(chunk) } = cache.try_get(key, 20, &mut out) {
            cache.put(chunk, key, 0.5, 20, &priors);
        }
    }

    c.bench_function("cache_probe_hit", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key = key % 4096 + 1;
            match cache.try_get(black_box(key), 20, &mut out) {
                CacheProbe::Hit { value } => black_box(value),
                CacheProbe::Miss { .. } => 0.0,
            }
        })
    });

    c.bench_function("cache_probe_miss", |b| {
        let mut key = 1_000_000u64;
        b.iter(|| {
            key += 1;
            black_box(matches!(
                cache.try_get(black_box(key), 20, &mut out),
                CacheProbe::Hit { .. }
            ))
        })
    });
}

criterion_group!(benches, bench_search, bench_cache_probe);
criterion_main!(benches);
