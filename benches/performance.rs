//! Performance benchmarks for the messaging client.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_channel::unbounded;
use light_link::{
    Client, ClientConfig, MemoryBroker, MemoryKv, MemoryObjects, Pattern, StorageResponder,
};
use std::io::Cursor;
use std::time::Duration;

fn connect(broker: &MemoryBroker) -> Client {
    let config = ClientConfig {
        address: "mem://bench".into(),
        ..Default::default()
    };
    Client::connect(config, broker.connector()).unwrap()
}

/// Benchmark pattern matching against subjects of varying depth
fn bench_subject_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("subject_matching");

    let patterns = ["orders.created", "orders.*", "orders.>", "*.*.*.*", "a.b.*.d.>"];
    for raw in patterns {
        let pattern = Pattern::parse(raw).unwrap();
        group.bench_with_input(BenchmarkId::new("pattern", raw), &pattern, |b, pattern| {
            b.iter(|| {
                black_box(pattern.matches(black_box("orders.created")));
                black_box(pattern.matches(black_box("a.b.c.d.e.f")));
            });
        });
    }

    group.finish();
}

/// Benchmark publish to delivery over the in-memory broker
fn bench_publish_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_dispatch");

    for batch in [1usize, 100, 1000] {
        let broker = MemoryBroker::new();
        let publisher = connect(&broker);
        let subscriber = connect(&broker);
        let (tx, rx) = unbounded();
        subscriber
            .subscribe("bench.>", move |msg| {
                tx.send(msg.payload.len())?;
                Ok(())
            })
            .unwrap();

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            b.iter(|| {
                for _ in 0..batch {
                    publisher.publish("bench.event", vec![0u8; 64]).unwrap();
                }
                for _ in 0..batch {
                    rx.recv_timeout(Duration::from_secs(5)).unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark KV round trips through the storage responder
fn bench_kv(c: &mut Criterion) {
    let broker = MemoryBroker::new();
    let host = connect(&broker);
    let _responder = StorageResponder::start(&host, MemoryKv::new(), MemoryObjects::new()).unwrap();
    let client = connect(&broker);
    client.kv().put("bench.key", b"seed".to_vec()).unwrap();

    let mut group = c.benchmark_group("kv");
    group.bench_function("put", |b| {
        b.iter(|| black_box(client.kv().put("bench.key", b"value".to_vec()).unwrap()));
    });
    group.bench_function("get", |b| {
        b.iter(|| black_box(client.kv().get("bench.key", None).unwrap()));
    });
    group.finish();
}

/// Benchmark object upload and download with varying sizes
fn bench_objects(c: &mut Criterion) {
    let broker = MemoryBroker::new();
    let host = connect(&broker);
    let _responder = StorageResponder::start(&host, MemoryKv::new(), MemoryObjects::new()).unwrap();
    let client = Client::connect(
        ClientConfig {
            address: "mem://bench".into(),
            chunk_size: 64 * 1024,
            ..Default::default()
        },
        broker.connector(),
    )
    .unwrap();

    let mut group = c.benchmark_group("objects");
    for size in [4 * 1024usize, 256 * 1024, 1024 * 1024] {
        let data = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("upload", size), &data, |b, data| {
            b.iter(|| {
                let id = client
                    .objects()
                    .upload(Cursor::new(data.as_slice()), "bench.bin")
                    .unwrap();
                client.objects().delete(&id).unwrap();
            });
        });

        let id = client
            .objects()
            .upload(Cursor::new(data.as_slice()), "bench.bin")
            .unwrap();
        group.bench_with_input(BenchmarkId::new("download", size), &id, |b, id| {
            b.iter(|| black_box(client.objects().download(id).unwrap().read_to_end().unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_subject_matching,
    bench_publish_dispatch,
    bench_kv,
    bench_objects,
);

criterion_main!(benches);
