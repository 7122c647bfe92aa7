//! Codec benchmarks for tandem-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tandem_protocol::{codec, ChangeEvent, ServerEvent};

fn change_event(size: usize) -> ServerEvent {
    ServerEvent::Change(ChangeEvent::update("alice", "doc1", "x".repeat(size)))
}

fn bench_binary(c: &mut Criterion) {
    let event = change_event(1024);
    let encoded = codec::encode(&event).unwrap();

    let mut group = c.benchmark_group("msgpack");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_1KB", |b| b.iter(|| codec::encode(black_box(&event))));
    group.bench_function("decode_1KB", |b| {
        b.iter(|| codec::decode::<ServerEvent>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let event = change_event(1024);
    let encoded = codec::encode_json(&event).unwrap();

    let mut group = c.benchmark_group("json");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_1KB", |b| {
        b.iter(|| codec::encode_json(black_box(&event)))
    });
    group.bench_function("decode_1KB", |b| {
        b.iter(|| codec::decode_json::<ServerEvent>(black_box(&encoded)))
    });
    group.finish();
}

criterion_group!(benches, bench_binary, bench_json);
criterion_main!(benches);
