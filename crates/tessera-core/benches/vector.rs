//! Benchmarks for the HNSW vector index.
//!
//! Run with: `cargo bench -p tessera-core --bench vector`
//!
//! Measures insert throughput into a growing graph and k-NN search latency
//! over the in-memory store, so numbers reflect the graph code rather than
//! disk I/O.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_core::storage::MemoryKvStore;
use tessera_core::{CancellationToken, DistanceType, HnswIndex, VectorIndexConfig};

// =============================================================================
// Benchmark Configuration
// =============================================================================

const DIMENSION: usize = 64;

/// Offset for query seeds so queries never coincide with indexed vectors.
const QUERY_SEED: u64 = 1_000_000;

// =============================================================================
// Test Data Generation
// =============================================================================

/// Deterministic unit vector derived from `seed`.
fn seeded_vector(seed: u64) -> Vec<f64> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let raw: Vec<f64> = (0..DIMENSION)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            i.hash(&mut hasher);
            (hasher.finish() as f64 / u64::MAX as f64) * 2.0 - 1.0
        })
        .collect();
    let norm = raw.iter().map(|x| x * x).sum::<f64>().sqrt();
    raw.into_iter().map(|x| x / norm).collect()
}

fn create_index(distance: DistanceType) -> HnswIndex<MemoryKvStore> {
    let config = VectorIndexConfig {
        dimension: DIMENSION,
        distance,
        seed: Some(7),
        ..Default::default()
    };
    HnswIndex::open(MemoryKvStore::new(), config).expect("open index")
}

fn populated_index(size: u64) -> HnswIndex<MemoryKvStore> {
    let index = create_index(DistanceType::Cosine);
    let cancel = CancellationToken::new();
    for i in 0..size {
        index
            .insert(&cancel, &format!("v{}", i), &seeded_vector(i))
            .expect("insert");
    }
    index
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_insert");
    group.sample_size(10);

    for size in [100u64, 500, 1000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| black_box(populated_index(size)));
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_search");
    let cancel = CancellationToken::new();
    let index = populated_index(2000);
    let query = seeded_vector(QUERY_SEED);

    for k in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("k", k), &k, |b, &k| {
            b.iter(|| black_box(index.search(&cancel, &query, k).expect("search")));
        });
    }
    group.finish();
}

fn bench_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("distance");
    let a = seeded_vector(1);
    let b = seeded_vector(2);

    for metric in [DistanceType::Cosine, DistanceType::L2, DistanceType::InnerProduct] {
        group.bench_function(metric.as_str(), |bench| {
            bench.iter(|| black_box(metric.distance(black_box(&a), black_box(&b))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_distance);
criterion_main!(benches);
