//! Benchmarks `EventHub::broadcast`'s fan-out path (spec.md §4.4): the
//! read-lock snapshot, forwarder invocation, and per-client `try_send`
//! that must stay lock-free for the duration of delivery.

use buckley_core::hub::{ClientFilter, Event, EventHub};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

fn broadcast_to_n_clients(rt: &Runtime, hub: &EventHub, n: usize) {
    rt.block_on(async {
        let mut subs = Vec::with_capacity(n);
        for _ in 0..n {
            let filter = ClientFilter { session_id: None, type_patterns: vec!["session.*".to_string()] };
            subs.push(hub.register_client(filter).await);
        }

        hub.broadcast(Event::new("session.updated", serde_json::json!({"status": "running"}))).await;

        for sub in subs {
            hub.unregister_client(sub.id).await;
        }
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("hub_broadcast");

    for &n in &[1usize, 16, 128, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let hub = EventHub::new();
            b.iter(|| broadcast_to_n_clients(&rt, &hub, n));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_broadcast);
criterion_main!(benches);
