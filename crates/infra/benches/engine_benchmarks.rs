use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use atelier_core::{AggregateId, AggregateType, CorrelationId, ExpectedVersion};
use atelier_events::{EventMetadata, UncommittedEvent, replay};
use atelier_infra::cache::{CacheOptions, InMemorySharedCache, MultiTierCache};
use atelier_infra::event_store::{EventStore, InMemoryEventStore};
use atelier_infra::{Engine, EngineConfig};
use atelier_products::{ChangePrice, CreateProduct, PriceChanged, ProductCommand, ProductCreated, ProductEvent};
use std::sync::Arc;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn product_history(id: AggregateId, count: usize) -> Vec<UncommittedEvent> {
    let metadata = EventMetadata::new(None, CorrelationId::new());
    let created = ProductEvent::ProductCreated(ProductCreated {
        sku: "br-001".to_string(),
        name: "Black Rose Crewneck".to_string(),
        price: 79.99,
        compare_at_price: None,
        description: None,
        images: vec![],
        collection: Some("black-rose".to_string()),
    });

    let mut events = vec![UncommittedEvent::from_typed(id, AggregateType::Product, metadata, &created).unwrap()];
    for i in 1..count {
        let changed = ProductEvent::PriceChanged(PriceChanged {
            old_price: 79.99 + (i - 1) as f64,
            new_price: 79.99 + i as f64,
        });
        events.push(UncommittedEvent::from_typed(id, AggregateType::Product, metadata, &changed).unwrap());
    }
    events
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let rt = runtime();
    let engine = Engine::in_memory(&EngineConfig::default()).unwrap();
    let create = CreateProduct::new("br-001", "Black Rose Crewneck", 79.99);
    let product_id = create.product_id;
    rt.block_on(engine.commands().dispatch(ProductCommand::CreateProduct(create)))
        .unwrap();

    let mut price = 79.99;
    c.bench_function("command_execute_change_price", |b| {
        b.iter(|| {
            price = if price > 90_000.0 { 1.0 } else { price + 1.0 };
            let committed = rt
                .block_on(engine.commands().dispatch(ProductCommand::ChangePrice(ChangePrice {
                    product_id,
                    new_price: price,
                })))
                .unwrap();
            black_box(committed);
        });
    });
}

fn bench_replay_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_speed");
    let rt = runtime();

    for event_count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*event_count as u64));
        group.bench_with_input(
            BenchmarkId::new("replay_from_store", event_count),
            event_count,
            |b, &count| {
                let store = InMemoryEventStore::new();
                let id = AggregateId::new();
                rt.block_on(store.append(product_history(id, count), ExpectedVersion::NoStream))
                    .unwrap();

                b.iter(|| {
                    let events = rt.block_on(store.load_stream(id)).unwrap();
                    black_box(replay(&events));
                });
            },
        );
    }

    group.finish();
}

fn bench_cache_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_reads");
    let rt = runtime();
    let cache = MultiTierCache::new(Some(Arc::new(InMemorySharedCache::new())), CacheOptions::default());
    rt.block_on(cache.set("product:hot", json!({ "sku": "br-001", "price": 79.99 }), None));

    group.bench_function("l1_hit", |b| {
        b.iter(|| black_box(rt.block_on(cache.get("product:hot"))));
    });

    group.bench_function("l1_miss_l2_miss", |b| {
        b.iter(|| black_box(rt.block_on(cache.get("product:cold"))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_replay_speed,
    bench_cache_reads
);
criterion_main!(benches);
