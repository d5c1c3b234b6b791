use std::{hint::black_box, sync::Arc};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use typebus::{
    envelope::codec, type_topic, ContextBag, Dispatcher, InMemoryBroker,
    InMemorySubscriptionStore, OutgoingMessage, Subscription, SubscriptionStore,
    TransportOperation, TransportTransaction, TypeDescriptor, TypeRegistry, TypeName,
};

const DEPTH: usize = 8;

/// Цепочка наследования Level0 <- Level1 <- ... <- Level7.
fn registry() -> TypeRegistry {
    let mut builder = TypeRegistry::builder().register(TypeDescriptor::class("Level0"));
    for level in 1..DEPTH {
        builder = builder.register(
            TypeDescriptor::class(format!("Level{level}")).extends(format!("Level{}", level - 1)),
        );
    }
    builder.build().unwrap()
}

/// Диспетчер, у которого подписаны `subscribed` ближайших предков листа.
fn dispatcher(
    rt: &Runtime,
    subscribed: usize,
) -> Dispatcher {
    let broker = InMemoryBroker::builder().auto_create_topics(true).build();
    let store = Arc::new(InMemorySubscriptionStore::new());
    rt.block_on(async {
        for level in (DEPTH - subscribed)..DEPTH {
            let interest = format!("Level{level}");
            store
                .add(&Subscription {
                    topic: type_topic(&interest).unwrap(),
                    interest_type: TypeName::new(&interest),
                    subscriber: format!("endpoint{level}"),
                })
                .await
                .unwrap();
        }
    });
    Dispatcher::new(
        "bench",
        Arc::new(broker),
        Arc::new(registry()),
        store,
        codec(),
    )
}

fn bench_publish_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let leaf = format!("Level{}", DEPTH - 1);
    let mut group = c.benchmark_group("publish_fan_out");
    for subscribed in [0usize, 1, 4, DEPTH] {
        let dispatcher = dispatcher(&rt, subscribed);
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribed),
            &subscribed,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let message = OutgoingMessage::builder(leaf.as_str())
                        .body(&b"{\"order\":42}"[..])
                        .build();
                    dispatcher
                        .dispatch(
                            TransportOperation::publish(black_box(message)),
                            &TransportTransaction::new(),
                            &ContextBag::new(),
                        )
                        .await
                        .unwrap()
                })
            },
        );
    }
    group.finish();
}

fn bench_ancestry_lookup(c: &mut Criterion) {
    let registry = registry();
    c.bench_function("registry_ancestry", |b| {
        b.iter(|| registry.ancestry(black_box("Level7")).unwrap())
    });
    c.bench_function("registry_is_assignable", |b| {
        b.iter(|| registry.is_assignable(black_box("Level7"), black_box("Level0")))
    });
}

criterion_group!(benches, bench_publish_fan_out, bench_ancestry_lookup);
criterion_main!(benches);
