//! Intent routing benchmarks
//!
//! Routing runs on every user message, so it must stay in the microsecond range
//! for each rule branch.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use slm_manager::catalog::Catalog;
use slm_manager::router::{IntentRouter, RouterConfig, RoutingContext};
use std::hint::black_box;

fn bench_route(c: &mut Criterion) {
    let catalog = Catalog::default();
    let router = IntentRouter::new(&catalog, RouterConfig::default());
    let context = RoutingContext {
        current_model_slug: "lfm2-700m".to_string(),
        has_document_corpus: true,
    };

    let mut group = c.benchmark_group("route");
    for (branch, message) in [
        ("action", "Turn on the flashlight"),
        ("reason", "Can you compare these two phone plans for me"),
        ("query", "What is the warranty period for this device?"),
        ("chat", "Hello there"),
        (
            "default",
            "I had a really interesting day at the museum with my family today",
        ),
    ] {
        group.bench_with_input(BenchmarkId::new("branch", branch), message, |b, message| {
            b.iter(|| router.route(black_box(message), &context));
        });
    }
    group.finish();
}

fn bench_route_long_message(c: &mut Criterion) {
    let catalog = Catalog::default();
    let router = IntentRouter::new(&catalog, RouterConfig::default());
    let context = RoutingContext::default();
    let message = "tell me a story about a dragon ".repeat(64);

    c.bench_function("route_long_message", |b| {
        b.iter(|| router.route(black_box(&message), &context));
    });
}

criterion_group!(benches, bench_route, bench_route_long_message);
criterion_main!(benches);
