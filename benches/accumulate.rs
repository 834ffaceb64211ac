use classmoments::{
    ChunkOptions, DenseSampleSource, EstimateOptions, GroupAssignment, estimate, estimate_chunked,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FEATURES: usize = 16;
const CLASSES: u32 = 4;

fn random_problem(rows: usize) -> (Array2<f64>, Array1<u32>) {
    let mut rng = StdRng::seed_from_u64(0xC1A5_5E5 + rows as u64);
    let samples = Array2::from_shape_fn((rows, FEATURES), |_| rng.sample(Standard));
    let labels = Array1::from_shape_fn(rows, |_| rng.gen_range(0..=CLASSES));
    (samples, labels)
}

fn benchmark_moments(c: &mut Criterion) {
    let sizes = [1_000_usize, 10_000, 100_000];
    let problems: Vec<_> = sizes
        .iter()
        .map(|&rows| (rows, random_problem(rows)))
        .collect();

    let mut group = c.benchmark_group("class_moments");
    for (rows, (samples, labels)) in problems.iter() {
        group.throughput(Throughput::Elements((*rows * FEATURES) as u64));

        group.bench_with_input(BenchmarkId::new("in_memory", rows), rows, |b, _| {
            b.iter(|| {
                let estimates = estimate(
                    black_box(samples.view()),
                    &GroupAssignment::hard(labels.view()),
                    &EstimateOptions::default(),
                );
                black_box(estimates)
            });
        });

        for block_rows in [256_usize, 4_096] {
            let id = BenchmarkId::new(format!("chunked_{block_rows}"), rows);
            group.bench_with_input(id, rows, |b, _| {
                b.iter(|| {
                    let mut source =
                        DenseSampleSource::new(samples.view(), Some(labels.view())).unwrap();
                    let options = ChunkOptions::new(EstimateOptions::default(), block_rows);
                    black_box(estimate_chunked(&mut source, &options).unwrap())
                });
            });
        }
    }
    group.finish();
}

criterion_group!(class_moments, benchmark_moments);
criterion_main!(class_moments);
