use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use feature_gate_hub::bench_support::MeteringBenchFixture;
use feature_gate_metering::Feature;

fn bench_access_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("access_control");
    group
        .sample_size(500)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3))
        .sampling_mode(SamplingMode::Auto);

    let fixture = MeteringBenchFixture::new("bench-customer").expect("bench fixture");

    group.bench_function(BenchmarkId::new("check_access", "capped"), |b| {
        b.iter(|| {
            let result = fixture.access.check_access(
                &fixture.customer_id,
                Feature::CreditScoring,
                1,
                None,
            );
            black_box(result)
        });
    });

    group.bench_function(BenchmarkId::new("consume_feature", "revalidate"), |b| {
        b.iter(|| {
            let result = fixture
                .access
                .consume_feature(fixture.request(Feature::CreditScoring, 1));
            black_box(result)
        });
    });

    group.bench_function(BenchmarkId::new("consume_feature", "reserved"), |b| {
        b.iter(|| {
            let check =
                fixture
                    .access
                    .check_access(&fixture.customer_id, Feature::AiAssistant, 1, None);
            let mut request = fixture.request(Feature::AiAssistant, 1);
            if let Some(token) = check.consumption_token() {
                request = request.with_token(token);
            }
            black_box(fixture.access.consume_feature(request))
        });
    });

    group.finish();
}

fn bench_token_metering(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_metering");
    group
        .sample_size(500)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3));

    let fixture = MeteringBenchFixture::new("bench-tokens").expect("bench fixture");

    group.bench_function("consume_tokens", |b| {
        b.iter(|| {
            let result = fixture.tokens.consume_tokens(&fixture.customer_id, 1, None);
            black_box(result)
        });
    });

    group.finish();
}

criterion_group!(access_latency, bench_access_control, bench_token_metering);
criterion_main!(access_latency);
