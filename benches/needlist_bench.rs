use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdcsync::config::RdcConfig;
use rdcsync::rdc::{create_need_list, generate_signatures, Chunker};

fn random_content(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Copy of `content` with 1% of its bytes overwritten in one place.
fn mutated(content: &[u8]) -> Vec<u8> {
    let mut changed = content.to_vec();
    let start = changed.len() / 3;
    let patch = random_content(changed.len() / 100, 99);
    changed[start..start + patch.len()].copy_from_slice(&patch);
    changed
}

fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    let chunker = Chunker::new(RdcConfig::default().content_chunk);

    for size in [64 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        let content = random_content(size, 1);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &content, |b, content| {
            b.iter(|| chunker.signatures_of(black_box(content)));
        });
    }
    group.finish();
}

fn bench_signature_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_levels");
    let config = RdcConfig::default();

    for size in [1024 * 1024, 8 * 1024 * 1024] {
        let content = random_content(size, 2);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &content, |b, content| {
            b.iter(|| generate_signatures(black_box(content.as_slice()), &config).unwrap());
        });
    }
    group.finish();
}

fn bench_need_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("need_list");
    let chunker = Chunker::new(RdcConfig::default().content_chunk);

    for size in [1024 * 1024, 8 * 1024 * 1024] {
        let seed = random_content(size, 3);
        let source = mutated(&seed);
        let seed_signatures = chunker.signatures_of(&seed);
        let source_signatures = chunker.signatures_of(&source);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                create_need_list(
                    black_box(&seed_signatures),
                    black_box(&source_signatures),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chunking, bench_signature_levels, bench_need_list);
criterion_main!(benches);
