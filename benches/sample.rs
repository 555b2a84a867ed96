use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vi_warmstart::{
    fit_variational, sample, sample_chain, Dataset, LinearRegression, SampleSettings,
    VariationalSettings,
};

fn make_model() -> LinearRegression {
    let data = Dataset::from_path(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/blr.data.json"))
        .unwrap();
    LinearRegression::from_data(&data).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let model = make_model();

    let vi_settings = VariationalSettings {
        seed: 42,
        output_samples: 0,
        ..Default::default()
    };
    c.bench_function("variational blr", |b| {
        b.iter(|| fit_variational(black_box(&model), vi_settings).unwrap())
    });

    let fit = fit_variational(&model, vi_settings).unwrap();
    let settings = SampleSettings {
        seed: 42,
        num_warmup: 100,
        num_draws: 100,
        ..Default::default()
    };
    c.bench_function("sample_chain blr 100+100", |b| {
        b.iter(|| sample_chain(black_box(&model), 0, None, &settings).unwrap())
    });

    c.bench_function("sample blr from estimate", |b| {
        b.iter(|| sample(black_box(&model), Some(&fit.estimate), settings).unwrap())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = criterion_benchmark
}
criterion_main!(benches);
