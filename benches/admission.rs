use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use integrations_inference_governor::{
    GovernorConfig, InferenceProvider, InferenceRequest, ProviderCall, ProviderError,
    ProviderResponse, RateGovernor, RateGovernorConfig, RequestOrchestrator, ResourceProfile,
    ResourceQuotaConfig, Usage,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

const RESOURCE: &str = "bench-model";

// Answers immediately so the benchmark measures governance overhead only.
struct InstantProvider;

#[async_trait]
impl InferenceProvider for InstantProvider {
    async fn complete(&self, _call: ProviderCall) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse::new("ok", Usage::new(8, 8)))
    }
}

fn unlimited() -> ResourceQuotaConfig {
    ResourceQuotaConfig::new(u32::MAX, u32::MAX, u64::MAX / 4, u64::MAX / 4)
}

fn bench_buckets(c: &mut Criterion) {
    let governor = RateGovernor::new(RateGovernorConfig::empty().resource(RESOURCE, unlimited()));

    c.bench_function("check_limit", |b| {
        b.iter(|| governor.check_limit(black_box(RESOURCE), black_box(128)).unwrap())
    });

    c.bench_function("try_reserve", |b| {
        b.iter(|| governor.try_reserve(black_box(RESOURCE), black_box(128)).unwrap())
    });

    c.bench_function("get_status", |b| {
        b.iter(|| governor.get_status(black_box(RESOURCE)).unwrap())
    });
}

fn bench_process(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = GovernorConfig::builder()
        .clear_profiles()
        .resource(RESOURCE, unlimited())
        .profile("bench", ResourceProfile::new(RESOURCE, 16))
        .build()
        .unwrap();
    let orchestrator = RequestOrchestrator::builder()
        .config(config)
        .provider(Arc::new(InstantProvider))
        .without_sweeper()
        .build()
        .unwrap();

    c.bench_function("process_uncontended", |b| {
        b.iter(|| {
            rt.block_on(orchestrator.process(InferenceRequest::new("bench", "ping")))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_buckets, bench_process);
criterion_main!(benches);
