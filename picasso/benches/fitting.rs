use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use picasso::{Config, FitObjective, Fitter, Frame, PsfVariant, SpotDetector, VecFrameSource};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};

const SIZE: usize = 128;
const BACKGROUND: f64 = 20.0;

/// Poisson frame with a grid of round spots every 16 pixels.
fn spot_frame(index: usize, rng: &mut StdRng) -> Frame {
    let sigma = 1.3;
    let photons = 2000.0;
    let norm = photons / (2.0 * std::f64::consts::PI * sigma * sigma);
    let spots: Vec<(f64, f64)> = (1..SIZE / 16)
        .flat_map(|gy| (1..SIZE / 16).map(move |gx| (gx as f64 * 16.0 + 0.3, gy as f64 * 16.0 - 0.2)))
        .collect();

    let pixels = (0..SIZE * SIZE)
        .map(|i| {
            let px = (i % SIZE) as f64;
            let py = (i / SIZE) as f64;
            let mean = BACKGROUND
                + spots
                    .iter()
                    .map(|&(x, y)| {
                        let r2 = (px - x).powi(2) + (py - y).powi(2);
                        norm * (-0.5 * r2 / (sigma * sigma)).exp()
                    })
                    .sum::<f64>();
            Poisson::new(mean).map_or(mean, |d| d.sample(rng)) as f32
        })
        .collect();
    Frame::new(index, SIZE, SIZE, pixels)
}

fn detection_benchmarks(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let frame = spot_frame(0, &mut rng);
    let detector = SpotDetector::new(&Config::default());

    c.bench_function("detect_128x128", |b| {
        b.iter(|| detector.detect_all(black_box(&frame)))
    });
}

fn fitting_benchmarks(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let frame = spot_frame(0, &mut rng);

    let mut group = c.benchmark_group("fit_frame");
    for (name, variant, objective) in [
        ("symmetric_mle", PsfVariant::SymmetricGaussian, FitObjective::PoissonMle),
        ("symmetric_lsq", PsfVariant::SymmetricGaussian, FitObjective::LeastSquares),
        ("elliptical_mle", PsfVariant::EllipticalGaussian, FitObjective::PoissonMle),
    ] {
        let config = Config {
            psf_model_variant: variant,
            fit_objective: objective,
            ..Default::default()
        };
        let candidates = SpotDetector::new(&config).detect_all(&frame);
        let fitter = Fitter::new(&config);

        group.bench_with_input(BenchmarkId::from_parameter(name), &candidates, |b, candidates| {
            b.iter(|| fitter.fit_all(black_box(&frame), candidates))
        });
    }
    group.finish();
}

fn pipeline_benchmarks(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(3);
    let source = VecFrameSource::new((0..20).map(|i| spot_frame(i, &mut rng)).collect());
    let config = Config::default();

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    group.bench_function("run_20_frames", |b| {
        b.iter(|| picasso::run(black_box(&source), &config))
    });
    group.finish();
}

criterion_group!(
    benches,
    detection_benchmarks,
    fitting_benchmarks,
    pipeline_benchmarks
);
criterion_main!(benches);
