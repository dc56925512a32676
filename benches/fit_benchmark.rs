use acuity::boost::{BoostParams, BoostSettings, BoostedEnsemble};
use acuity::linear::{LogisticPipeline, SolverSettings, sigmoid};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const NUM_FEATURES: usize = 20;
const COHORT_SIZES: [usize; 3] = [1_000, 5_000, 20_000];

/// A synthetic ICU cohort: standard normal features, a handful of which drive
/// mortality, with 5% of entries missing.
fn simulate_cohort(n: usize) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(2024);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut x = Array2::from_shape_fn((n, NUM_FEATURES), |_| normal.sample(&mut rng));
    let y = x
        .rows()
        .into_iter()
        .map(|row| {
            let eta = -2.0 + 0.9 * row[0] - 0.6 * row[1] + 0.4 * row[2] * row[3];
            if rng.r#gen::<f64>() < sigmoid(eta) { 1.0 } else { 0.0 }
        })
        .collect::<Array1<f64>>();
    x.mapv_inplace(|v| if rng.r#gen::<f64>() < 0.05 { f64::NAN } else { v });
    (x, y)
}

fn bench_logistic(c: &mut Criterion) {
    let mut group = c.benchmark_group("logistic_fit");
    group.sample_size(20);
    for &n in &COHORT_SIZES {
        let (x, y) = simulate_cohort(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                LogisticPipeline::fit(
                    black_box(x.view()),
                    black_box(y.view()),
                    1.0,
                    &SolverSettings::default(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_boosted(c: &mut Criterion) {
    let mut group = c.benchmark_group("boosted_fit");
    group.sample_size(10);
    let params = BoostParams {
        n_estimators: 50,
        max_depth: 4,
        subsample: 0.8,
        colsample_bytree: 0.8,
        learning_rate: 0.1,
        ..BoostParams::default()
    };
    for &n in &COHORT_SIZES {
        let (x, y) = simulate_cohort(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                BoostedEnsemble::fit(
                    black_box(x.view()),
                    black_box(y.view()),
                    &params,
                    &BoostSettings::default(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_logistic, bench_boosted);
criterion_main!(benches);
